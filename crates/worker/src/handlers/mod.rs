//! Handlers this worker knows how to run.

use jobward_queue::{JobService, QueueStore};

pub mod import;

/// Register every handler on `service`.
pub fn register_all<S>(service: &JobService<S>)
where
    S: QueueStore + Clone + 'static,
{
    service.register_handler(import::JOB_TYPE, import::handle);
}
