//! Lifecycle tests driving a worker against the in-memory broker.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rstest::{fixture, rstest};
use serde_json::json;
use tempfile::TempDir;

use super::*;
use crate::error::ErrorKind;
use crate::message::Message;
use crate::operator::Operator;
use crate::test_support::{self, HealthEvent, MemoryBroker, RecordingHealth};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitRequested(i32);

struct PanicExit;

impl ProcessExit for PanicExit {
    fn exit(&self, code: i32) -> ! {
        panic::panic_any(ExitRequested(code))
    }
}

/// Raises termination after a fixed number of health checks.
#[derive(Debug, Clone, Default)]
struct ScriptedSignals {
    terminate_after: Option<usize>,
    fail_install: bool,
    checks: Arc<AtomicUsize>,
}

impl ScriptedSignals {
    fn terminate_after(checks: usize) -> Self {
        Self {
            terminate_after: Some(checks),
            ..Self::default()
        }
    }
}

impl SignalSource for ScriptedSignals {
    fn install(&mut self) -> io::Result<()> {
        if self.fail_install {
            Err(io::Error::other("no signals for you"))
        } else {
            Ok(())
        }
    }

    fn pending(&self) -> Option<SignalRequest> {
        let seen = self.checks.fetch_add(1, Ordering::SeqCst);
        match self.terminate_after {
            Some(limit) if seen >= limit => Some(SignalRequest::Terminate),
            _ => None,
        }
    }
}

struct Worker {
    broker: MemoryBroker,
    health: RecordingHealth,
    dir: TempDir,
}

impl Worker {
    fn pid_path(&self) -> std::path::PathBuf {
        self.dir.path().join("emissary-main.pid")
    }

    fn server(&self, signals: ScriptedSignals) -> Server<MemoryBroker> {
        let operator = Operator::new(
            test_support::NODE,
            test_support::settings(),
            self.broker.clone(),
        );
        Server::new(operator, test_support::registry(), self.pid_path())
            .with_health(Arc::new(self.health.clone()))
            .with_signals(Box::new(signals))
            .with_exit(Box::new(PanicExit))
    }

    fn exit_code(&self, signals: ScriptedSignals) -> i32 {
        run_to_exit(self.server(signals))
    }

    fn published_recipients(&self) -> Vec<String> {
        self.broker
            .published()
            .into_iter()
            .map(|(_, message)| message.recipient().to_owned())
            .collect()
    }
}

/// Runs `startup` to completion and returns the requested exit code.
fn run_to_exit(mut server: Server<MemoryBroker>) -> i32 {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("runtime");
    let payload = panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(server.startup())))
        .expect_err("startup must end the process");
    payload
        .downcast::<ExitRequested>()
        .map(|exit| exit.0)
        .unwrap_or_else(|other| panic::resume_unwind(other))
}

#[fixture]
fn worker() -> Worker {
    Worker {
        broker: MemoryBroker::new(),
        health: RecordingHealth::default(),
        dir: tempfile::tempdir().expect("tempdir"),
    }
}

fn assert_pid_removed(path: &Path) {
    assert!(!path.exists(), "pid file {} left behind", path.display());
}

#[rstest]
fn terminate_signal_shuts_down_gracefully(worker: Worker) {
    let code = worker.exit_code(ScriptedSignals::terminate_after(2));

    assert_eq!(code, 0);
    assert_eq!(
        worker.published_recipients(),
        ["controller.startup", "controller.shutdown"]
    );
    assert!(worker.broker.closed());
    assert_pid_removed(&worker.pid_path());
    assert_eq!(
        worker.health.events(),
        vec![
            HealthEvent::Starting,
            HealthEvent::Running,
            HealthEvent::ShutdownStarted(ShutdownKind::Graceful),
            HealthEvent::Exiting(0),
        ]
    );
}

#[rstest]
fn connection_failure_forces_hard_shutdown(worker: Worker) {
    worker.broker.fail_connect(ErrorKind::Connection);
    let code = worker.exit_code(ScriptedSignals::default());

    assert_eq!(code, 1);
    assert!(worker.broker.events().is_empty());
    assert_pid_removed(&worker.pid_path());
    assert_eq!(
        worker.health.events(),
        vec![
            HealthEvent::Starting,
            HealthEvent::OperatorFailed(ErrorKind::Connection),
            HealthEvent::ShutdownStarted(ShutdownKind::Hard),
            HealthEvent::Exiting(1),
        ]
    );
}

#[rstest]
fn other_start_failure_shuts_down_gracefully(worker: Worker) {
    worker.broker.fail_bind();
    let code = worker.exit_code(ScriptedSignals::default());

    assert_eq!(code, 0);
    assert_eq!(worker.published_recipients(), ["controller.shutdown"]);
    assert!(worker.broker.closed());
}

#[rstest]
fn signal_installation_failure_is_hard(worker: Worker) {
    let signals = ScriptedSignals {
        fail_install: true,
        ..ScriptedSignals::default()
    };
    let code = worker.exit_code(signals);

    assert_eq!(code, 1);
    assert!(worker.broker.events().is_empty());
    assert_pid_removed(&worker.pid_path());
}

#[rstest]
fn failing_close_still_exits(worker: Worker) {
    worker.broker.fail_close();
    let code = worker.exit_code(ScriptedSignals::terminate_after(1));

    assert_eq!(code, 0);
    assert!(worker.health.events().contains(&HealthEvent::StepFailed));
    assert_pid_removed(&worker.pid_path());
}

#[rstest]
fn panicking_close_still_exits(worker: Worker) {
    worker.broker.panic_on_close();
    let code = worker.exit_code(ScriptedSignals::terminate_after(1));

    assert_eq!(code, 0);
    assert!(worker.health.events().contains(&HealthEvent::StepFailed));
    assert_eq!(worker.health.events().last(), Some(&HealthEvent::Exiting(0)));
}

#[rstest]
fn inbound_requests_are_answered_and_acked(worker: Worker) {
    let request = Message::new("controller.replies", "node-7:direct", "ping.ping", Vec::new());
    let tag = worker.broker.deliver(&request);
    let code = worker.exit_code(ScriptedSignals::terminate_after(3));

    assert_eq!(code, 0);
    let reply = worker
        .broker
        .published()
        .into_iter()
        .map(|(_, message)| message)
        .find(|message| message.in_reply_to() == Some(request.uuid()))
        .expect("ping reply");
    assert_eq!(reply.args(), [json!("node-7"), json!("pong")]);
    assert_eq!(worker.broker.acked(), vec![tag]);
}

#[rstest]
fn ended_consumer_stream_shuts_down_gracefully(worker: Worker) {
    worker.broker.end_stream();
    let code = worker.exit_code(ScriptedSignals::default());

    assert_eq!(code, 0);
    assert!(worker.broker.closed());
}

#[rstest]
fn lost_connection_skips_shutdown_notice(worker: Worker) {
    let signals = DroppingSignals {
        inner: ScriptedSignals::default(),
        broker: worker.broker.clone(),
    };
    let server = worker
        .server(ScriptedSignals::default())
        .with_signals(Box::new(signals));

    assert_eq!(run_to_exit(server), 0);
    assert_eq!(worker.published_recipients(), ["controller.startup"]);
    assert!(!worker.broker.closed());
}

/// Drops the broker connection at every health check.
struct DroppingSignals {
    inner: ScriptedSignals,
    broker: MemoryBroker,
}

impl SignalSource for DroppingSignals {
    fn install(&mut self) -> io::Result<()> {
        self.inner.install()
    }

    fn pending(&self) -> Option<SignalRequest> {
        self.broker.drop_connection();
        self.inner.pending()
    }
}

#[cfg(target_os = "linux")]
#[rstest]
fn stats_are_reported_on_the_configured_interval(worker: Worker) {
    // Stats run every 60s; health checks run twice a second.
    let code = worker.exit_code(ScriptedSignals::terminate_after(130));

    assert_eq!(code, 0);
    let reports: Vec<Message> = worker
        .broker
        .published()
        .into_iter()
        .map(|(_, message)| message)
        .filter(|message| message.message_type() == "stats.report")
        .collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].recipient(), "stats.3");
}

#[test]
fn exit_codes_follow_shutdown_kind() {
    assert_eq!(ShutdownKind::Graceful.exit_code(), 0);
    assert_eq!(ShutdownKind::Hard.exit_code(), 1);
    assert_eq!(ShutdownKind::Hard.to_string(), "hard");
}
