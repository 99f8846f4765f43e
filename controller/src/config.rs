//! Config is the single explicit runtime-configuration struct.

use std::time::Duration;

/// ControllerConfig carries every tunable the process accepts.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Workers caps concurrent in-flight reconciles per registered kind.
    pub workers: usize,
    /// Resync_period re-lists every watched kind to heal missed events.
    pub resync_period: Duration,
    /// Queue_max_retries bounds per-item retries before the item is
    /// dropped.
    pub queue_max_retries: u32,
    /// Shutdown_timeout is how long in-flight reconciles get to finish
    /// after cancellation.
    pub shutdown_timeout: Duration,
    /// Allow_crd_deletion permits deleting a synthesized CRD when its RGD
    /// goes away.
    pub allow_crd_deletion: bool,
    /// Default_requeue_duration is the wait for not-yet-ready dependencies.
    pub default_requeue_duration: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            resync_period: Duration::from_secs(10 * 60 * 60),
            queue_max_retries: 20,
            shutdown_timeout: Duration::from_secs(30),
            allow_crd_deletion: false,
            default_requeue_duration: Duration::from_secs(30),
        }
    }
}
