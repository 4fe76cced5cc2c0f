//! Trace writer thread
//!
//! Sink I/O runs on its own thread behind a bounded queue, so a slow or wedged sink
//! never blocks the capture loop. The producer side can tell how long the current
//! write has been in flight and fault on it without waiting for the write to return.

use super::sink::TraceSink;
use super::writer::TraceLine;
use crate::types::SinkError;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Lines queued ahead of the sink before producers have to wait
const QUEUE_CAPACITY: usize = 1024;

/// Called on the writer thread after each record line reached the sink
pub type RecordListener = Box<dyn FnMut(&TraceLine) + Send>;

enum Command {
    Header(String),
    Record(TraceLine),
    Flush,
    Finish,
}

#[derive(Default)]
struct WriterState {
    /// Record lines accepted by the sink
    written: u64,
    /// Sequence (None for header lines) and start of the write in progress
    in_flight: Option<(Option<u64>, Instant)>,
    failure: Option<SinkError>,
    stopped: bool,
}

/// Handle to the writer thread
pub(crate) struct SinkWorker {
    tx: Sender<Command>,
    done_rx: Receiver<io::Result<()>>,
    state: Arc<Mutex<WriterState>>,
    handle: Option<JoinHandle<()>>,
}

impl SinkWorker {
    pub(crate) fn spawn(
        sink: Box<dyn TraceSink>,
        listener: Option<RecordListener>,
    ) -> Result<Self, SinkError> {
        let (tx, rx) = bounded(QUEUE_CAPACITY);
        let (done_tx, done_rx) = bounded(1);
        let state = Arc::new(Mutex::new(WriterState::default()));

        let thread_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name("trace-writer".to_string())
            .spawn(move || run_writer(sink, rx, done_tx, thread_state, listener))
            .map_err(|source| SinkError::WriteFailed {
                sequence: None,
                source,
            })?;

        Ok(Self {
            tx,
            done_rx,
            state,
            handle: Some(handle),
        })
    }

    pub(crate) fn submit_header(
        &self,
        line: String,
        limit: Option<Duration>,
    ) -> Result<(), SinkError> {
        self.send(Command::Header(line), None, limit)
    }

    pub(crate) fn submit_record(
        &self,
        line: TraceLine,
        limit: Option<Duration>,
    ) -> Result<(), SinkError> {
        let sequence = line.sequence;
        self.send(Command::Record(line), Some(sequence), limit)
    }

    fn send(
        &self,
        command: Command,
        sequence: Option<u64>,
        limit: Option<Duration>,
    ) -> Result<(), SinkError> {
        self.check(limit)?;
        let started = Instant::now();
        match limit {
            Some(threshold) => self.tx.send_timeout(command, threshold).map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SinkError::BackpressureTimeout {
                    sequence: sequence.unwrap_or(0),
                    elapsed: started.elapsed(),
                    threshold,
                },
                SendTimeoutError::Disconnected(_) => writer_gone(sequence),
            }),
            None => self.tx.send(command).map_err(|_| writer_gone(sequence)),
        }
    }

    /// Report a failed write, or a write stuck for longer than `limit`
    pub(crate) fn check(&self, limit: Option<Duration>) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if let Some(failure) = state.failure.take() {
            return Err(failure);
        }
        if state.stopped {
            return Err(writer_gone(None));
        }
        if let (Some(threshold), Some((sequence, since))) = (limit, state.in_flight) {
            let elapsed = since.elapsed();
            if elapsed > threshold {
                return Err(SinkError::BackpressureTimeout {
                    sequence: sequence.unwrap_or(0),
                    elapsed,
                    threshold,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn written(&self) -> u64 {
        self.state.lock().written
    }

    /// Queue a flush without waiting for it
    pub(crate) fn request_flush(&self) -> Result<(), SinkError> {
        match self.tx.try_send(Command::Flush) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(writer_gone(None)),
        }
    }

    /// Drain the queue, finish the sink and join the thread
    ///
    /// With a deadline, a writer that does not finish in time is left behind and
    /// `BackpressureTimeout` is returned.
    pub(crate) fn finish(&mut self, deadline: Option<Duration>) -> Result<(), SinkError> {
        let started = Instant::now();
        let last = Some(self.written()).filter(|n| *n > 0);

        let sent = match deadline {
            Some(threshold) => self.tx.send_timeout(Command::Finish, threshold).is_ok(),
            None => self.tx.send(Command::Finish).is_ok(),
        };
        if !sent {
            if let Some(failure) = self.state.lock().failure.take() {
                return Err(failure);
            }
            return Err(match deadline {
                Some(threshold) if started.elapsed() >= threshold => {
                    self.abandon(threshold, started, last)
                }
                _ => writer_gone(last),
            });
        }

        let outcome = match deadline {
            Some(threshold) => {
                let remaining = threshold.saturating_sub(started.elapsed());
                match self.done_rx.recv_timeout(remaining) {
                    Ok(outcome) => outcome,
                    Err(_) => return Err(self.abandon(threshold, started, last)),
                }
            }
            None => self.done_rx.recv().unwrap_or_else(|_| {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "trace writer exited"))
            }),
        };

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Trace writer thread panicked");
            }
        }
        if let Some(failure) = self.state.lock().failure.take() {
            return Err(failure);
        }
        outcome.map_err(|source| SinkError::WriteFailed {
            sequence: last,
            source,
        })
    }

    fn abandon(&mut self, threshold: Duration, started: Instant, last: Option<u64>) -> SinkError {
        log::warn!("Trace writer did not finish within {:?}; detaching it", threshold);
        self.handle = None;
        SinkError::BackpressureTimeout {
            sequence: last.unwrap_or(0),
            elapsed: started.elapsed(),
            threshold,
        }
    }
}

fn writer_gone(sequence: Option<u64>) -> SinkError {
    SinkError::WriteFailed {
        sequence,
        source: io::Error::new(io::ErrorKind::BrokenPipe, "trace writer stopped"),
    }
}

fn run_writer(
    mut sink: Box<dyn TraceSink>,
    rx: Receiver<Command>,
    done_tx: Sender<io::Result<()>>,
    state: Arc<Mutex<WriterState>>,
    mut listener: Option<RecordListener>,
) {
    let begin = |sequence: Option<u64>| {
        state.lock().in_flight = Some((sequence, Instant::now()));
    };
    let fail = |sequence: Option<u64>, source: io::Error| {
        log::error!("Trace sink write failed: {}", source);
        let mut state = state.lock();
        state.in_flight = None;
        state.failure = Some(SinkError::WriteFailed { sequence, source });
        state.stopped = true;
    };

    for command in rx.iter() {
        match command {
            Command::Header(text) => {
                begin(None);
                if let Err(e) = sink.write_line(&text) {
                    fail(None, e);
                    return;
                }
                state.lock().in_flight = None;
            }
            Command::Record(line) => {
                begin(Some(line.sequence));
                if let Err(e) = sink.write_line(&line.text) {
                    fail(Some(line.sequence), e);
                    return;
                }
                {
                    let mut state = state.lock();
                    state.in_flight = None;
                    state.written += 1;
                }
                if let Some(listener) = listener.as_mut() {
                    listener(&line);
                }
            }
            Command::Flush => {
                begin(None);
                if let Err(e) = sink.flush() {
                    fail(None, e);
                    return;
                }
                state.lock().in_flight = None;
            }
            Command::Finish => {
                begin(None);
                let outcome = sink.finish();
                {
                    let mut state = state.lock();
                    state.in_flight = None;
                    state.stopped = true;
                }
                let _ = done_tx.send(outcome);
                return;
            }
        }
    }

    // Recorder dropped without finishing
    if let Err(e) = sink.flush() {
        log::warn!("Trace flush on drop failed: {}", e);
    }
    state.lock().stopped = true;
}
