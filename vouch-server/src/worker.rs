//! Background trust-map worker.
//!
//! A single cooperative thread drains the store's trust-map queue: pop an
//! `(identifier, depth)` job, regenerate that viewpoint's trust map, repeat.
//! An empty queue sleeps for about a second. The shutdown flag is checked
//! between iterations; errors are logged and the loop continues.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::store::{Store, StoreError};

const IDLE_SLEEP: Duration = Duration::from_secs(1);

/// Spawn the worker thread. It exits once [`Store::shutdown`] is requested.
pub fn spawn(store: Arc<Store>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("trustmap-worker".into())
        .spawn(move || run(&store))
        .expect("failed to spawn trust-map worker")
}

fn run(store: &Store) {
    tracing::debug!("trust-map worker started");
    while !store.is_shutdown() {
        let Some(job) = store.take_trust_map_job() else {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        };
        match store.generate_trust_map(&job.id, job.depth) {
            Ok(()) => {
                tracing::debug!(id = %job.id, depth = job.depth, "trust map regenerated");
            }
            Err(StoreError::Shutdown) => {
                store.finish_trust_map_job(&job.id);
                break;
            }
            Err(e) => {
                tracing::warn!(id = %job.id, error = %e, "trust map generation failed");
            }
        }
        store.finish_trust_map_job(&job.id);
    }
    tracing::debug!("trust-map worker stopped");
}
