//! The admission controller itself: waiter and reservation queues, the
//! completion log, and the evaluator that decides when the next waiter may
//! proceed.
//!
//! All mutable state lives in a single mutex. The evaluator runs to
//! completion inside that critical section, so the size-comparison
//! invariants between the queues hold at every suspension point.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::Error;

/// A pending admission request. The grant channel doubles as the removal
/// notification: sending on it hands the caller its [`ReleaseHandle`].
struct Waiter {
    id: u64,
    grant: oneshot::Sender<ReleaseHandle>,
}

/// A deferred re-evaluation, 1:1 with a waiter that is already known to be
/// admissible once the oldest in-window completion expires.
struct Reservation {
    id: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct GateState {
    /// Timestamps of counted completions, oldest first.
    completions: VecDeque<Instant>,
    waiters: VecDeque<Waiter>,
    reservations: VecDeque<Reservation>,
    /// Admissions granted and not yet released.
    running: usize,
}

struct Shared {
    interval: Duration,
    limit: usize,
    next_id: AtomicU64,
    state: Mutex<GateState>,
}

impl Shared {
    /// The evaluator. Runs after every state change and on every reservation
    /// timer expiry; admits at most one waiter per invocation.
    fn poll(shared: &Arc<Self>, state: &mut GateState) {
        loop {
            // Every pending waiter already has a reservation in flight, or
            // there are no waiters at all.
            if state.waiters.len() <= state.reservations.len() {
                return;
            }
            let in_use = state.running + state.reservations.len();
            if in_use >= shared.limit {
                return;
            }
            if state.completions.len() >= shared.limit - in_use {
                // Capacity is constrained by the oldest relevant completion,
                // not by current occupancy. Consume the log entry: either it
                // is stale, or the reservation below takes over its expiry.
                let oldest = state
                    .completions
                    .pop_front()
                    .expect("completion log is non-empty here");
                let now = Instant::now();
                if now.duration_since(oldest) < shared.interval {
                    Self::schedule_reservation(shared, state, oldest, now);
                    return;
                }
            }
            state.running += 1;
            let waiter = state
                .waiters
                .pop_front()
                .expect("waiter queue is non-empty here");
            trace!(
                running = state.running,
                reserved = state.reservations.len(),
                "admitting waiter"
            );
            let handle = ReleaseHandle {
                shared: Arc::clone(shared),
            };
            if waiter.grant.send(handle).is_err() {
                // The acquire future was dropped before its grant arrived.
                // Revoke the slot and admit the next waiter instead.
                state.running -= 1;
                continue;
            }
            return;
        }
    }

    /// Spawn a timer that fires when `oldest` leaves the trailing window,
    /// then pops its own reservation and re-runs the evaluator.
    fn schedule_reservation(
        shared: &Arc<Self>,
        state: &mut GateState,
        oldest: Instant,
        now: Instant,
    ) {
        let deadline = oldest
            .checked_add(shared.interval)
            .unwrap_or_else(|| panic!("Could not add {:?} to {:?}", shared.interval, oldest));
        let id = shared.next_id.fetch_add(1, Relaxed);
        trace!(delay = ?(deadline - now), "scheduling reservation");
        let shared = Arc::clone(shared);
        let timer = tokio::spawn(async move {
            sleep_until(deadline).await;
            let mut state = shared.state.lock().unwrap();
            // An abort can lose the race with this task waking up. The entry
            // being gone already means the reservation was discarded, and
            // this firing must not pop anything else.
            if let Some(pos) = state.reservations.iter().position(|r| r.id == id) {
                state.reservations.remove(pos);
                Shared::poll(&shared, &mut state);
            }
        });
        state.reservations.push_back(Reservation { id, timer });
    }

    /// Discard the most recently scheduled reservation, if any. Aborting an
    /// already-fired timer is a no-op.
    fn drop_newest_reservation(state: &mut GateState) {
        if let Some(reservation) = state.reservations.pop_back() {
            reservation.timer.abort();
        }
    }
}

/// A sliding-window admission controller: at most `limit` executions may be
/// in flight or counted as completed within any trailing `interval`.
///
/// Waiters are granted in strict FIFO order relative to their acquire calls.
/// Cloning is cheap and all clones share one window.
#[derive(Clone)]
pub struct RateGate {
    shared: Arc<Shared>,
}

impl RateGate {
    /// Create a gate admitting at most `limit` executions per `interval`.
    pub fn new(interval: Duration, limit: usize) -> Result<Self, Error> {
        if limit == 0 {
            return Err(Error::InvalidConfiguration);
        }
        Ok(Self {
            shared: Arc::new(Shared {
                interval,
                limit,
                next_id: AtomicU64::new(1),
                state: Mutex::new(GateState::default()),
            }),
        })
    }

    /// Wait until execution is possible.
    ///
    /// Returns a [`ReleaseHandle`] that must be released exactly once when
    /// the protected work is done.
    pub async fn acquire(&self) -> ReleaseHandle {
        let (_, rx) = self.enqueue();
        rx.await.expect("gate outlives its pending waiters")
    }

    /// Like [`acquire`](Self::acquire), but gives up when `token` fires.
    ///
    /// A token already cancelled at call time fails immediately without
    /// touching the queue. Cancelling after the grant has been delivered has
    /// no effect; the grant wins and the handle is returned as usual.
    pub async fn acquire_with(&self, token: CancellationToken) -> Result<ReleaseHandle, Error> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (id, mut rx) = self.enqueue();
        tokio::select! {
            granted = &mut rx => Ok(granted.expect("gate outlives its pending waiters")),
            _ = token.cancelled() => {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                    state.waiters.remove(pos);
                    // Reserved capacity no longer backed by a waiter.
                    if state.waiters.len() < state.reservations.len() {
                        Shared::drop_newest_reservation(&mut state);
                    }
                    debug!("pending acquisition cancelled");
                    return Err(Error::Cancelled);
                }
                drop(state);
                // Already off the queue: the grant beat the cancellation.
                Ok(rx.try_recv().expect("granted waiter holds its handle"))
            }
        }
    }

    /// Run `f` under the gate: acquire, execute, release counted.
    ///
    /// The release happens however `f`'s future exits, including panic or
    /// cancellation of the wrapping future.
    pub async fn throttle<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let permit = self.acquire().await;
        let _guard = ReleaseOnDrop(Some(permit));
        f().await
    }

    /// Number of executions currently admitted and not yet released.
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().unwrap().running
    }

    /// Number of reservation timers currently scheduled.
    pub fn reserved(&self) -> usize {
        self.shared.state.lock().unwrap().reservations.len()
    }

    /// Number of callers waiting to be admitted.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().unwrap().waiters.len()
    }

    fn enqueue(&self) -> (u64, oneshot::Receiver<ReleaseHandle>) {
        let (tx, rx) = oneshot::channel();
        let id = self.shared.next_id.fetch_add(1, Relaxed);
        let mut state = self.shared.state.lock().unwrap();
        state.waiters.push_back(Waiter { id, grant: tx });
        Shared::poll(&self.shared, &mut state);
        (id, rx)
    }
}

/// Proof of admission. Must be released exactly once; consuming `self`
/// makes a double release unrepresentable.
pub struct ReleaseHandle {
    shared: Arc<Shared>,
}

impl ReleaseHandle {
    /// Signal that the admitted execution is done.
    ///
    /// With `counted` set, the completion occupies one slot of the trailing
    /// window. An uncounted release frees the slot as if the execution never
    /// happened, discarding the most recently scheduled reservation timer
    /// along with it. Must be called from within a tokio runtime.
    pub fn release(self, counted: bool) {
        let mut state = self.shared.state.lock().unwrap();
        state.running -= 1;
        if counted {
            state.completions.push_back(Instant::now());
        } else {
            Shared::drop_newest_reservation(&mut state);
        }
        Shared::poll(&self.shared, &mut state);
    }
}

struct ReleaseOnDrop(Option<ReleaseHandle>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if let Some(permit) = self.0.take() {
            permit.release(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn gate(interval_ms: u64, limit: usize) -> RateGate {
        RateGate::new(Duration::from_millis(interval_ms), limit).unwrap()
    }

    #[test]
    fn zero_limit_is_rejected() {
        let res = RateGate::new(Duration::from_secs(1), 0);
        match res {
            Err(Error::InvalidConfiguration) => (),
            _ => panic!("Unexpected result"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accounting_tracks_grant_and_release() {
        let gate = gate(1000, 2);

        let a = gate.acquire().await;
        let b = gate.acquire().await;
        assert_eq!(gate.in_flight(), 2);
        assert_eq!(gate.pending(), 0);

        a.release(true);
        assert_eq!(gate.in_flight(), 1);
        b.release(true);
        assert_eq!(gate.in_flight(), 0);
    }

    /// A token cancelled before the call must fail without enqueueing.
    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_token_mutates_nothing() {
        let gate = gate(1000, 1);

        let token = CancellationToken::new();
        token.cancel();

        let res = gate.acquire_with(token).await;
        assert_eq!(res.err(), Some(Error::Cancelled));
        assert_eq!(gate.pending(), 0);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.reserved(), 0);
    }

    /// Cancelling the only waiter must also discard the reservation that
    /// was backing it.
    #[tokio::test(start_paused = true)]
    async fn cancel_discards_unbacked_reservation() {
        let gate = gate(1000, 1);

        gate.acquire().await.release(true);

        let token = CancellationToken::new();
        let pending = {
            let gate = gate.clone();
            let token = token.clone();
            tokio::spawn(async move { gate.acquire_with(token).await })
        };
        // Let the waiter enqueue and the evaluator park a reservation.
        tokio::task::yield_now().await;
        assert_eq!(gate.reserved(), 1);

        token.cancel();
        let res = pending.await.unwrap();
        assert_eq!(res.err(), Some(Error::Cancelled));
        assert_eq!(gate.pending(), 0);
        assert_eq!(gate.reserved(), 0);
    }

    /// An uncounted release leaves no trace in the completion window.
    #[tokio::test(start_paused = true)]
    async fn uncounted_release_frees_the_slot() {
        let gate = gate(1000, 1);

        gate.acquire().await.release(false);

        // A counted completion would have made this wait a full second.
        let start = Instant::now();
        gate.acquire().await.release(true);
        assert_eq!(Instant::now() - start, Duration::from_millis(0));
    }

    /// A waiter whose acquire future is dropped must not wedge the queue.
    #[tokio::test(start_paused = true)]
    async fn dropped_waiter_does_not_block_successors() {
        let gate = gate(1000, 1);

        let held = gate.acquire().await;

        let abandoned = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _ = gate.acquire().await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(gate.pending(), 1);
        abandoned.abort();
        let _ = abandoned.await;

        let succeeding = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let permit = gate.acquire().await;
                permit.release(true);
                Instant::now() - start
            })
        };
        tokio::task::yield_now().await;
        held.release(true);

        // The abandoned waiter is skipped; only the held slot's window
        // expiry gates the successor.
        advance(Duration::from_millis(1000)).await;
        let waited = succeeding.await.unwrap();
        assert_eq!(waited, Duration::from_millis(1000));
    }

    /// Cancellation arriving together with the grant resolves in favor of
    /// the grant.
    #[tokio::test(start_paused = true)]
    async fn grant_wins_over_simultaneous_cancel() {
        let gate = gate(1000, 1);

        let held = gate.acquire().await;

        let token = CancellationToken::new();
        let waiter = {
            let gate = gate.clone();
            let token = token.clone();
            tokio::spawn(async move { gate.acquire_with(token).await })
        };
        tokio::task::yield_now().await;

        // Deliver the grant and fire the token before the waiter is polled
        // again; whichever select branch wakes first, the grant must win.
        held.release(false);
        token.cancel();

        let permit = waiter.await.unwrap().expect("grant must win");
        permit.release(true);
        assert_eq!(gate.in_flight(), 0);
    }
}
