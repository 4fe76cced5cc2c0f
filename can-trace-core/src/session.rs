//! Session controller and capture loop
//!
//! The controller owns the adapter lifecycle and the session state machine:
//!
//! ```text
//! Idle → Connecting → Recording ⇄ Paused → Stopped
//!            └──────────────┴────────┴──→ Faulted → Stopped
//! ```
//!
//! Recording runs on one dedicated capture thread. Per poll it receives a frame,
//! normalizes it and, while Recording, feeds the cycle tracker and then the trace
//! recorder. Control calls and the loop serialize on the state mutex; the loop checks
//! for a stop request after every poll, so stop latency is bounded by the poll
//! timeout.
//!
//! Trace lines are written on the recorder's own writer thread. `Line` notifications
//! and the lines-written counter are driven from there, once a line is in the sink.

use crate::adapter::{AdapterKind, CanAdapter, OpenAdapter, Received, VendorFrame};
use crate::config::SessionConfig;
use crate::cycle::{CycleStatSnapshot, CycleTracker};
use crate::normalizer::{normalize, ClockOrigin};
use crate::observer::{
    Counter, DiagnosticCounters, Diagnostics, Notification, ObserverHub, SessionStateChange,
};
use crate::trace::{RecordListener, TraceHeader, TraceLine, TraceRecorder, TraceSink};
use crate::types::{
    Bitrate, CanId, FaultReason, Result, SessionError, SessionFault, SessionState, SinkError,
    WallClock,
};
use chrono::Local;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Static facts about the running (or last) session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub adapter: AdapterKind,
    pub channel: String,
    pub bitrate: Bitrate,
    pub start_time: WallClock,
}

struct Shared {
    state: SessionState,
    fault: Option<SessionFault>,
    stop_requested: bool,
}

/// State shared between the controller and the capture thread
struct Core {
    shared: Mutex<Shared>,
    tracker: Mutex<CycleTracker>,
    counters: DiagnosticCounters,
    hub: ObserverHub,
    /// Bumped on reset so a lingering writer cannot report into the next session
    generation: AtomicU64,
}

impl Core {
    fn publish(&self, notification: Notification) {
        self.hub.publish(notification, &self.counters);
    }

    fn publish_diagnostics(&self) {
        self.publish(Notification::Diagnostics(self.counters.snapshot()));
    }

    /// Writer-thread callback: announce each line once it reached the sink
    fn line_listener(self: &Arc<Self>) -> RecordListener {
        let core = Arc::clone(self);
        let generation = core.generation.load(Ordering::Acquire);
        Box::new(move |line: &TraceLine| {
            if core.generation.load(Ordering::Acquire) != generation {
                return;
            }
            core.publish(Notification::Line(line.clone()));
            core.counters.set(Counter::LinesWritten, line.sequence);
        })
    }

    fn transition(&self, shared: &mut Shared, to: SessionState, fault: Option<SessionFault>) {
        let from = shared.state;
        shared.state = to;
        match &fault {
            Some(f) => {
                log::error!("Session {} -> {}: {}", from, to, f);
                shared.fault = Some(f.clone());
            }
            None => log::info!("Session {} -> {}", from, to),
        }
        self.publish(Notification::StateChange(SessionStateChange {
            from,
            to,
            fault,
            at: Local::now(),
        }));
    }

    fn enter_fault(&self, reason: FaultReason, message: String, last_seen: Option<(u64, CanId)>) {
        let mut shared = self.shared.lock();
        // Errors racing a requested stop are not faults
        if shared.stop_requested
            || shared.state == SessionState::Stopped
            || shared.state == SessionState::Faulted
        {
            return;
        }
        let fault = SessionFault {
            reason,
            message,
            at: Local::now(),
            last_timestamp_us: last_seen.map(|(ts, _)| ts),
            last_id: last_seen.map(|(_, id)| id),
        };
        self.transition(&mut shared, SessionState::Faulted, Some(fault));
    }
}

/// Resources owned by the capture thread while it runs
struct CaptureParts {
    adapter: OpenAdapter,
    recorder: TraceRecorder,
}

struct CaptureContext {
    core: Arc<Core>,
    origin: ClockOrigin,
    poll_timeout: Duration,
    disconnect_limit: u32,
}

/// Owns one recording session at a time
pub struct SessionController {
    adapter: Box<dyn CanAdapter>,
    config: SessionConfig,
    core: Arc<Core>,
    info: Option<SessionInfo>,
    worker: Option<JoinHandle<CaptureParts>>,
}

impl SessionController {
    /// Create an idle controller around a configured adapter
    pub fn new(adapter: Box<dyn CanAdapter>, config: SessionConfig) -> Self {
        Self {
            adapter,
            config,
            core: Arc::new(Core {
                shared: Mutex::new(Shared {
                    state: SessionState::Idle,
                    fault: None,
                    stop_requested: false,
                }),
                tracker: Mutex::new(CycleTracker::new()),
                counters: DiagnosticCounters::default(),
                hub: ObserverHub::new(),
                generation: AtomicU64::new(0),
            }),
            info: None,
            worker: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.core.shared.lock().state
    }

    /// Fault that moved the session to Faulted, if any
    pub fn fault(&self) -> Option<SessionFault> {
        self.core.shared.lock().fault.clone()
    }

    pub fn info(&self) -> Option<&SessionInfo> {
        self.info.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Read-only copy of the per-id cycle statistics, sorted by id
    pub fn cycle_stats(&self) -> Vec<CycleStatSnapshot> {
        self.core.tracker.lock().snapshot()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.core.counters.snapshot()
    }

    /// Subscribe to the notification feed with a bounded queue
    pub fn subscribe(&self, capacity: usize) -> Receiver<Notification> {
        self.core.hub.subscribe(capacity)
    }

    /// Open the adapter and start recording into `sink`
    pub fn start(
        &mut self,
        channel: &str,
        bitrate: Bitrate,
        sink: Box<dyn TraceSink>,
    ) -> Result<()> {
        {
            let mut shared = self.core.shared.lock();
            if shared.state != SessionState::Idle {
                return Err(SessionError::InvalidTransition {
                    action: "start",
                    state: shared.state,
                });
            }
            self.core
                .transition(&mut shared, SessionState::Connecting, None);
        }

        let kind = self.adapter.kind();
        log::info!("Opening {} channel {} at {}", kind, channel, bitrate);
        let adapter = match self.adapter.open(channel, bitrate) {
            Ok(handle) => OpenAdapter::new(handle),
            Err(e) => {
                self.core.enter_fault(e.fault_reason(), e.to_string(), None);
                return Err(e.into());
            }
        };

        let start_time = Local::now();
        let header = TraceHeader::new(channel, bitrate)
            .with_generator(self.config.generator.clone())
            .with_start_time(start_time);
        let recorder = match TraceRecorder::spawn(
            sink,
            &header,
            self.config.sink_backpressure(),
            Some(self.core.line_listener()),
        ) {
            Ok(recorder) => recorder,
            Err(e) => {
                // `adapter` is closed when it goes out of scope
                self.core.enter_fault(e.fault_reason(), e.to_string(), None);
                return Err(e.into());
            }
        };

        let ctx = CaptureContext {
            core: Arc::clone(&self.core),
            origin: ClockOrigin::at(adapter.clock_origin()),
            poll_timeout: self.config.poll_timeout(),
            disconnect_limit: self.config.disconnect_limit(),
        };
        self.info = Some(SessionInfo {
            adapter: kind,
            channel: channel.to_string(),
            bitrate,
            start_time,
        });

        {
            let mut shared = self.core.shared.lock();
            shared.stop_requested = false;
            self.core
                .transition(&mut shared, SessionState::Recording, None);
        }

        let parts = CaptureParts { adapter, recorder };
        let spawned = thread::Builder::new()
            .name("can-capture".to_string())
            .spawn(move || run_capture(ctx, parts));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                let message = format!("failed to spawn capture thread: {}", e);
                self.core
                    .enter_fault(FaultReason::CaptureThread, message.clone(), None);
                Err(SessionError::CaptureThread(message))
            }
        }
    }

    /// Recording → Paused; frames arriving while paused are discarded
    pub fn pause(&self) -> Result<()> {
        self.switch("pause", SessionState::Recording, SessionState::Paused)
    }

    /// Paused → Recording
    pub fn resume(&self) -> Result<()> {
        self.switch("resume", SessionState::Paused, SessionState::Recording)
    }

    fn switch(&self, action: &'static str, from: SessionState, to: SessionState) -> Result<()> {
        let mut shared = self.core.shared.lock();
        if shared.state != from {
            return Err(SessionError::InvalidTransition {
                action,
                state: shared.state,
            });
        }
        self.core.transition(&mut shared, to, None);
        Ok(())
    }

    /// Stop recording: join the capture thread, close the adapter, finalize the trace
    ///
    /// Stopping an already stopped session does nothing. Waiting for the trace writer
    /// is bounded by the finalize timeout, or by the backpressure threshold once the
    /// session has faulted or the writer is stuck. When the session had faulted, finalization is best effort
    /// and its errors are only logged.
    pub fn stop(&mut self) -> Result<()> {
        {
            let mut shared = self.core.shared.lock();
            match shared.state {
                SessionState::Stopped => {
                    log::debug!("Session already stopped");
                    return Ok(());
                }
                SessionState::Idle | SessionState::Connecting => {
                    return Err(SessionError::InvalidTransition {
                        action: "stop",
                        state: shared.state,
                    });
                }
                SessionState::Recording | SessionState::Paused | SessionState::Faulted => {
                    shared.stop_requested = true;
                }
            }
        }

        let parts = match self.worker.take() {
            Some(handle) => match handle.join() {
                Ok(parts) => Some(parts),
                Err(_) => {
                    log::error!("Capture thread panicked; adapter released during unwind");
                    None
                }
            },
            None => None,
        };

        let faulted = self.state() == SessionState::Faulted;
        let mut result = Ok(());
        if let Some(CaptureParts {
            mut adapter,
            mut recorder,
        }) = parts
        {
            adapter.close();

            // A writer already stuck or failed only gets the backpressure threshold
            let mut healthy = !faulted;
            if healthy {
                if let Err(e) = recorder.check() {
                    log::error!("Trace writer failed before stop: {}", e);
                    result = Err(SessionError::Sink(e));
                    healthy = false;
                }
            }
            let deadline = match self.config.sink_backpressure() {
                Some(threshold) if !healthy => threshold.min(self.config.finalize_timeout()),
                _ => self.config.finalize_timeout(),
            };

            if let Err(e) = recorder.finish_within(Some(deadline)) {
                if healthy {
                    log::error!("Trace finalization failed: {}", e);
                    result = Err(SessionError::Sink(e));
                } else {
                    log::warn!("Best-effort trace finalization failed: {}", e);
                }
            }
        }

        let mut shared = self.core.shared.lock();
        self.core
            .transition(&mut shared, SessionState::Stopped, None);
        result
    }

    /// Discard a Stopped or Faulted session and return to Idle
    ///
    /// Clears cycle statistics and diagnostic counters. A Faulted session is stopped
    /// first.
    pub fn reset(&mut self) -> Result<()> {
        match self.state() {
            SessionState::Idle => return Ok(()),
            SessionState::Faulted => self.stop()?,
            SessionState::Stopped => {}
            state => {
                return Err(SessionError::InvalidTransition {
                    action: "reset",
                    state,
                })
            }
        }

        self.core.generation.fetch_add(1, Ordering::AcqRel);
        self.core.tracker.lock().reset();
        self.core.counters.reset();
        self.info = None;

        let mut shared = self.core.shared.lock();
        shared.fault = None;
        shared.stop_requested = false;
        self.core.transition(&mut shared, SessionState::Idle, None);
        Ok(())
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.stop() {
                log::warn!("Error stopping session on drop: {}", e);
            }
        }
    }
}

/// Capture loop body; returns the parts so `stop()` can release them
fn run_capture(ctx: CaptureContext, mut parts: CaptureParts) -> CaptureParts {
    let core = &ctx.core;
    let mut disconnects = 0u32;
    let mut last_seen: Option<(u64, CanId)> = None;

    log::debug!("Capture loop started on {}", parts.adapter.channel());

    loop {
        if core.shared.lock().stop_requested {
            break;
        }
        if let Err(e) = parts.recorder.check() {
            core.enter_fault(e.fault_reason(), e.to_string(), last_seen);
            break;
        }

        match parts.adapter.receive(ctx.poll_timeout) {
            Ok(Received::Timeout) => {
                disconnects = 0;
            }
            Ok(Received::Frame(frame)) => {
                disconnects = 0;
                core.counters.bump(Counter::FramesReceived);
                if let Err(e) = handle_frame(&ctx, &mut parts.recorder, &frame, &mut last_seen) {
                    core.enter_fault(e.fault_reason(), e.to_string(), last_seen);
                    break;
                }
            }
            Err(e) if e.is_retriable() => {
                disconnects += 1;
                if disconnects >= ctx.disconnect_limit {
                    core.enter_fault(
                        e.fault_reason(),
                        format!("{} ({} consecutive attempts)", e, disconnects),
                        last_seen,
                    );
                    break;
                }
                core.counters.bump(Counter::DisconnectRetries);
                core.publish_diagnostics();
                log::warn!(
                    "{} (attempt {}/{}), retrying",
                    e,
                    disconnects,
                    ctx.disconnect_limit
                );
                thread::sleep(ctx.poll_timeout);
            }
            Err(e) => {
                core.enter_fault(e.fault_reason(), e.to_string(), last_seen);
                break;
            }
        }
    }

    if core.shared.lock().state == SessionState::Faulted {
        parts.adapter.close();
        if let Err(e) = parts.recorder.flush() {
            log::warn!("Best-effort trace flush failed: {}", e);
        }
    }

    log::debug!(
        "Capture loop exited after {} records",
        parts.recorder.lines_recorded()
    );
    parts
}

/// Normalize one frame and, while Recording, feed tracker then recorder
fn handle_frame(
    ctx: &CaptureContext,
    recorder: &mut TraceRecorder,
    frame: &VendorFrame,
    last_seen: &mut Option<(u64, CanId)>,
) -> std::result::Result<(), SinkError> {
    let core = &ctx.core;

    let event = match normalize(frame, &ctx.origin) {
        Ok(event) => event,
        Err(e) => {
            log::warn!("Dropping frame: {}", e);
            core.counters.bump(Counter::InvalidFrames);
            core.publish_diagnostics();
            return Ok(());
        }
    };

    match core.shared.lock().state {
        SessionState::Recording => {}
        SessionState::Paused => {
            log::trace!("Discarding 0x{} while paused", event.id());
            core.counters.bump(Counter::PausedDiscards);
            return Ok(());
        }
        _ => return Ok(()),
    }

    *last_seen = Some((event.timestamp_us(), event.id()));

    let snapshot = core.tracker.lock().observe(&event);
    core.publish(Notification::Event(event));
    core.publish(Notification::CycleStat(snapshot));

    let clamps_before = recorder.jitter_clamps();
    recorder.record(event)?;
    if recorder.jitter_clamps() != clamps_before {
        core.counters
            .set(Counter::JitterClamps, recorder.jitter_clamps());
        core.publish_diagnostics();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{VirtualAdapter, VirtualBus};
    use crate::trace::MemorySink;
    use crate::types::AdapterError;

    fn controller(bus: &VirtualBus) -> SessionController {
        SessionController::new(
            Box::new(VirtualAdapter::new(bus.clone())),
            SessionConfig::new().with_poll_timeout(Duration::from_millis(10)),
        )
    }

    #[test]
    fn test_control_calls_outside_a_session() {
        let bus = VirtualBus::new("vcan0");
        let mut session = controller(&bus);

        assert_eq!(session.state(), SessionState::Idle);
        assert!(matches!(
            session.pause(),
            Err(SessionError::InvalidTransition { action: "pause", .. })
        ));
        assert!(matches!(
            session.stop(),
            Err(SessionError::InvalidTransition { action: "stop", .. })
        ));
        assert!(session.reset().is_ok());
    }

    #[test]
    fn test_open_failure_faults_session() {
        let bus = VirtualBus::new("vcan0");
        bus.set_present(false);
        let mut session = controller(&bus);

        let err = session
            .start("vcan0", Bitrate::Kbps500, Box::new(MemorySink::new()))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Adapter(AdapterError::HardwareNotFound { .. })
        ));
        assert_eq!(session.state(), SessionState::Faulted);
        assert_eq!(
            session.fault().map(|f| f.reason),
            Some(FaultReason::HardwareNotFound)
        );

        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn test_start_requires_idle() {
        let bus = VirtualBus::new("vcan0");
        let mut session = controller(&bus);
        session
            .start("vcan0", Bitrate::Kbps500, Box::new(MemorySink::new()))
            .unwrap();

        let again = session.start("vcan0", Bitrate::Kbps500, Box::new(MemorySink::new()));
        assert!(matches!(
            again,
            Err(SessionError::InvalidTransition {
                action: "start",
                state: SessionState::Recording
            })
        ));

        session.stop().unwrap();
        assert!(session
            .start("vcan0", Bitrate::Kbps500, Box::new(MemorySink::new()))
            .is_err());

        session.reset().unwrap();
        session
            .start("vcan0", Bitrate::Kbps250, Box::new(MemorySink::new()))
            .unwrap();
        assert_eq!(bus.opened_with(), Some(Bitrate::Kbps250));
        session.stop().unwrap();
    }

    #[test]
    fn test_drop_releases_adapter() {
        let bus = VirtualBus::new("vcan0");
        {
            let mut session = controller(&bus);
            session
                .start("vcan0", Bitrate::Kbps500, Box::new(MemorySink::new()))
                .unwrap();
        }
        assert_eq!(bus.close_count(), 1);
    }
}
