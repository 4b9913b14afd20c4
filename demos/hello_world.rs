//! Construct a gate that admits 5 executions every 5 seconds, then push a
//! stream of jobs through it, randomly discarding some as not counted.

use rate_gate::RateGate;

use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::time::Instant;

#[tokio::main]
async fn main() {
    let gate = RateGate::new(Duration::from_secs(5), 5).unwrap();

    let start = Instant::now();

    let mut rng = thread_rng();

    for job in 0..20u32 {
        let permit = gate.acquire().await;
        println!("Job {} admitted at {:?}", job, Instant::now() - start);

        // Pretend some calls never reached the resource; those give their
        // slot straight back.
        let counted = rng.gen_range(0..4) != 0;
        permit.release(counted);
    }
}
