//! Metrics contains the metrics setup for the controller.

use metrics::{counter, describe_counter, Counter};

/// Register describes every metric the controllers emit.
pub fn register() {
    describe_counter!("kro_reconciles_total", "Total reconciler invocations");
    describe_counter!(
        "kro_reconcile_failures_total",
        "Reconciler invocations that returned an error"
    );
    describe_counter!(
        "kro_queue_drops_total",
        "Items dropped after exhausting their retry budget"
    );
    describe_counter!(
        "kro_registrations_total",
        "Dynamic reconciler registrations"
    );
}

/// Reconciles returns the run counter for one controller.
pub fn reconciles(controller: &str) -> Counter {
    counter!("kro_reconciles_total", "controller" => controller.to_string())
}

/// Failures returns the failure counter for one controller.
pub fn failures(controller: &str) -> Counter {
    counter!("kro_reconcile_failures_total", "controller" => controller.to_string())
}

/// Queue_drops returns the drop counter for one controller.
pub fn queue_drops(controller: &str) -> Counter {
    counter!("kro_queue_drops_total", "controller" => controller.to_string())
}

/// Registrations returns the registration counter.
pub fn registrations() -> Counter {
    counter!("kro_registrations_total")
}
