//! Structured health reporting for worker lifecycle events.

use std::sync::Arc;

use crate::error::EmissaryError;
use crate::server::ShutdownKind;

/// Observer trait used to surface lifecycle events to telemetry sinks.
pub trait HealthReporter: Send + Sync {
    /// Invoked when a worker begins its startup sequence.
    fn server_starting(&self, node: &str);

    /// Invoked once the operator has connected and subscribed.
    fn server_running(&self, node: &str);

    /// Invoked when the operator fails to start.
    fn operator_failed(&self, node: &str, error: &EmissaryError);

    /// Invoked when a shutdown of the given kind begins.
    fn shutdown_started(&self, node: &str, kind: ShutdownKind, reason: &str);

    /// Invoked when a graceful shutdown step fails; termination continues.
    fn shutdown_step_failed(&self, node: &str, detail: &str);

    /// Invoked immediately before the process exits.
    fn exiting(&self, node: &str, code: i32);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter + ?Sized,
{
    fn server_starting(&self, node: &str) {
        (**self).server_starting(node);
    }

    fn server_running(&self, node: &str) {
        (**self).server_running(node);
    }

    fn operator_failed(&self, node: &str, error: &EmissaryError) {
        (**self).operator_failed(node, error);
    }

    fn shutdown_started(&self, node: &str, kind: ShutdownKind, reason: &str) {
        (**self).shutdown_started(node, kind, reason);
    }

    fn shutdown_step_failed(&self, node: &str, detail: &str) {
        (**self).shutdown_step_failed(node, detail);
    }

    fn exiting(&self, node: &str, code: i32) {
        (**self).exiting(node, code);
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn server_starting(&self, node: &str) {
        tracing::info!(
            target: "emissary::health",
            event = "server_starting",
            node,
            "starting worker"
        );
    }

    fn server_running(&self, node: &str) {
        tracing::info!(
            target: "emissary::health",
            event = "server_running",
            node,
            "worker connected and subscribed"
        );
    }

    fn operator_failed(&self, node: &str, error: &EmissaryError) {
        tracing::error!(
            target: "emissary::health",
            event = "operator_failed",
            node,
            kind = %error.kind(),
            error = %error,
            "operator failed to start"
        );
    }

    fn shutdown_started(&self, node: &str, kind: ShutdownKind, reason: &str) {
        tracing::info!(
            target: "emissary::health",
            event = "shutdown_started",
            node,
            kind = %kind,
            reason,
            "worker shutting down"
        );
    }

    fn shutdown_step_failed(&self, node: &str, detail: &str) {
        tracing::error!(
            target: "emissary::health",
            event = "shutdown_step_failed",
            node,
            detail,
            "graceful shutdown step failed; terminating anyway"
        );
    }

    fn exiting(&self, node: &str, code: i32) {
        tracing::info!(
            target: "emissary::health",
            event = "exiting",
            node,
            code,
            "worker exiting"
        );
    }
}
