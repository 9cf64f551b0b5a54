//! Liveness monitor
//!
//! Every error a job hits passes through [`LivenessMonitor::inspect`]. Errors
//! that mean the engine can no longer serve anything are fatal: the process
//! exits at once with code 1 so the platform replaces the worker. Everything
//! else is handed back unchanged and only fails the job.
//!
//! Classification is a case-insensitive substring match of the error's
//! message against [`FATAL_MESSAGE_MARKERS`] and of its kind name against
//! [`FATAL_KIND_MARKERS`]. Configuration can add markers.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use llmrelay_common::config::LivenessConfig;
use llmrelay_common::{RelayError, METRICS};
use tracing::{debug, error, warn};

/// Exit code used for fatal engine failures and start-up failures
pub const FATAL_EXIT_CODE: i32 = 1;

/// Message fragments that mark an engine as dead
pub const FATAL_MESSAGE_MARKERS: &[&str] = &[
    "EngineCore encountered an issue",
    "EngineCoreError",
    "EngineDeadError",
    "engine is dead",
];

/// Kind-name fragments that mark an engine as dead
pub const FATAL_KIND_MARKERS: &[&str] = &["EngineDead", "EngineCoreError"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Fatal,
    NonFatal,
}

/// Marker tables, stored lowercase
#[derive(Debug, Clone)]
pub struct FatalMarkers {
    messages: Vec<String>,
    kinds: Vec<String>,
}

impl FatalMarkers {
    pub fn builtin() -> Self {
        Self {
            messages: FATAL_MESSAGE_MARKERS.iter().map(|m| m.to_lowercase()).collect(),
            kinds: FATAL_KIND_MARKERS.iter().map(|m| m.to_lowercase()).collect(),
        }
    }

    /// Built-in markers plus the configured extras
    pub fn with_extra(config: &LivenessConfig) -> Self {
        let mut markers = Self::builtin();
        markers.messages.extend(
            config
                .extra_message_markers
                .iter()
                .filter(|m| !m.is_empty())
                .map(|m| m.to_lowercase()),
        );
        markers.kinds.extend(
            config
                .extra_kind_markers
                .iter()
                .filter(|m| !m.is_empty())
                .map(|m| m.to_lowercase()),
        );
        markers
    }

    pub fn classify(&self, message: &str, kind: &str) -> FailureClass {
        let message = message.to_lowercase();
        let kind = kind.to_lowercase();

        let fatal = self.messages.iter().any(|m| message.contains(m.as_str()))
            || self.kinds.iter().any(|k| kind.contains(k.as_str()));

        if fatal {
            FailureClass::Fatal
        } else {
            FailureClass::NonFatal
        }
    }
}

impl Default for FatalMarkers {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Classify with the built-in markers only
pub fn classify(message: &str, kind: &str) -> FailureClass {
    FatalMarkers::builtin().classify(message, kind)
}

/// Ends the process
pub trait Terminator: Send + Sync {
    fn terminate(&self, code: i32);
}

/// Immediate OS-level exit that skips unwinding and atexit hooks
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn terminate(&self, code: i32) {
        // SAFETY: _exit is async-signal-safe and never returns
        unsafe { libc::_exit(code) }
    }
}

/// Log a start-up failure and exit with [`FATAL_EXIT_CODE`]
pub fn exit_on_startup_failure(err: &RelayError, terminator: &dyn Terminator) {
    error!(kind = err.kind_name(), "Worker failed to start: {}", err);
    terminator.terminate(FATAL_EXIT_CODE);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Running = 0,
    Handling = 1,
    Propagating = 2,
    Terminating = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Running,
            1 => WorkerState::Handling,
            2 => WorkerState::Propagating,
            _ => WorkerState::Terminating,
        }
    }
}

/// What happened to an inspected error
#[derive(Debug)]
pub enum Verdict {
    /// Hand the error back to the host
    Propagate(RelayError),
    /// The terminator was called; the error must not surface
    Terminated,
}

/// Tracks worker state and decides the fate of every job error
pub struct LivenessMonitor {
    markers: FatalMarkers,
    terminator: Arc<dyn Terminator>,
    state: AtomicU8,
    in_flight: AtomicUsize,
}

impl LivenessMonitor {
    pub fn new(markers: FatalMarkers, terminator: Arc<dyn Terminator>) -> Self {
        Self {
            markers,
            terminator,
            state: AtomicU8::new(WorkerState::Running as u8),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Terminating is final; every other transition is allowed
    fn transition(&self, to: WorkerState) {
        let terminating = WorkerState::Terminating as u8;
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != terminating).then_some(to as u8)
            });
    }

    /// Mark a job as started. Dropping the guard marks it finished.
    pub fn begin_job(self: &Arc<Self>) -> JobGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        METRICS.jobs.active_jobs.inc();
        self.transition(WorkerState::Handling);
        JobGuard {
            monitor: Arc::clone(self),
        }
    }

    /// Decide what to do with an error caught while handling a job
    pub fn inspect(&self, err: RelayError) -> Verdict {
        let message = err.to_string();
        let kind = err.kind_name().to_string();

        match self.markers.classify(&message, &kind) {
            FailureClass::Fatal => {
                error!(
                    kind = %kind,
                    "Engine failure is unrecoverable, terminating worker: {}", message
                );
                METRICS.engine.fatal_errors.inc();
                self.transition(WorkerState::Terminating);
                self.terminator.terminate(FATAL_EXIT_CODE);
                Verdict::Terminated
            }
            FailureClass::NonFatal => {
                warn!(kind = %kind, "Job failed: {}", message);
                self.transition(WorkerState::Propagating);
                Verdict::Propagate(err)
            }
        }
    }
}

/// In-flight job marker
pub struct JobGuard {
    monitor: Arc<LivenessMonitor>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        METRICS.jobs.active_jobs.dec();
        if self.monitor.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.monitor.transition(WorkerState::Running);
            debug!("Worker idle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTerminator;

    fn monitor() -> (Arc<LivenessMonitor>, Arc<RecordingTerminator>) {
        let terminator = Arc::new(RecordingTerminator::default());
        let monitor = Arc::new(LivenessMonitor::new(
            FatalMarkers::builtin(),
            terminator.clone(),
        ));
        (monitor, terminator)
    }

    #[test]
    fn test_classify_message_markers() {
        for message in [
            "EngineCore encountered an issue. See stack trace for details.",
            "raised EngineCoreError in worker",
            "EngineDeadError",
            "The ENGINE IS DEAD",
        ] {
            assert_eq!(classify(message, "RuntimeError"), FailureClass::Fatal, "{}", message);
        }
    }

    #[test]
    fn test_classify_kind_markers() {
        assert_eq!(classify("no details", "EngineDeadError"), FailureClass::Fatal);
        assert_eq!(classify("no details", "AsyncEngineDead"), FailureClass::Fatal);
        assert_eq!(classify("no details", "enginecoreerror"), FailureClass::Fatal);
    }

    #[test]
    fn test_classify_non_fatal() {
        assert_eq!(classify("CUDA out of memory", "RuntimeError"), FailureClass::NonFatal);
        assert_eq!(
            classify("Validation error: input requires either prompt or messages", "ValidationError"),
            FailureClass::NonFatal
        );
        assert_eq!(classify("", ""), FailureClass::NonFatal);
    }

    #[test]
    fn test_configured_markers_extend_builtin() {
        let markers = FatalMarkers::with_extra(&LivenessConfig {
            extra_message_markers: vec!["NCCL timeout".into(), String::new()],
            extra_kind_markers: vec!["WatchdogError".into()],
        });

        assert_eq!(markers.classify("nccl TIMEOUT on rank 0", "X"), FailureClass::Fatal);
        assert_eq!(markers.classify("x", "WatchdogError"), FailureClass::Fatal);
        assert_eq!(markers.classify("engine is dead", "X"), FailureClass::Fatal);
        assert_eq!(markers.classify("unrelated", "X"), FailureClass::NonFatal);
    }

    #[test]
    fn test_fatal_error_terminates_without_propagating() {
        let (monitor, terminator) = monitor();
        let _job = monitor.begin_job();

        let verdict = monitor.inspect(RelayError::engine("RuntimeError", "EngineDeadError"));
        assert!(matches!(verdict, Verdict::Terminated));
        assert_eq!(terminator.codes(), vec![FATAL_EXIT_CODE]);
        assert_eq!(monitor.state(), WorkerState::Terminating);
    }

    #[test]
    fn test_non_fatal_error_is_returned_unchanged() {
        let (monitor, terminator) = monitor();
        let _job = monitor.begin_job();

        let verdict = monitor.inspect(RelayError::engine("UpstreamError", "bad gateway"));
        match verdict {
            Verdict::Propagate(RelayError::Engine { kind, message }) => {
                assert_eq!(kind, "UpstreamError");
                assert_eq!(message, "bad gateway");
            }
            other => panic!("unexpected verdict {:?}", other),
        }
        assert!(terminator.codes().is_empty());
        assert_eq!(monitor.state(), WorkerState::Propagating);
    }

    #[test]
    fn test_state_follows_jobs() {
        let (monitor, _) = monitor();
        assert_eq!(monitor.state(), WorkerState::Running);

        let first = monitor.begin_job();
        let second = monitor.begin_job();
        assert_eq!(monitor.state(), WorkerState::Handling);
        assert_eq!(monitor.in_flight(), 2);

        drop(first);
        assert_eq!(monitor.state(), WorkerState::Handling);
        drop(second);
        assert_eq!(monitor.state(), WorkerState::Running);
    }

    #[test]
    fn test_terminating_is_sticky() {
        let (monitor, _) = monitor();
        let job = monitor.begin_job();
        monitor.inspect(RelayError::engine("EngineDead", "x"));
        drop(job);

        let _next = monitor.begin_job();
        assert_eq!(monitor.state(), WorkerState::Terminating);
    }

    #[test]
    fn test_startup_failure_exits_with_one() {
        let terminator = RecordingTerminator::default();
        exit_on_startup_failure(&RelayError::startup("engine unreachable"), &terminator);
        assert_eq!(terminator.codes(), vec![1]);
    }
}
