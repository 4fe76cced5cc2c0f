//! Trace recorder
//!
//! Renders canonical events into PCAN `.TRC` v1.1 records. The session timestamp of
//! a record comes from the event's device timestamp rebased to session start, never
//! from the wall clock at write time, so inter-frame timing survives a slow sink.

use super::sink::TraceSink;
use super::worker::{RecordListener, SinkWorker};
use super::FILE_VERSION;
use crate::types::{Bitrate, CanEvent, SinkError, WallClock};
use chrono::Local;
use serde::Serialize;
use std::time::Duration;

/// OLE automation date of the Unix epoch (days since 1899-12-30)
const OLE_UNIX_EPOCH_DAYS: f64 = 25_569.0;
const MILLIS_PER_DAY: f64 = 86_400_000.0;

const COLUMN_LEGEND: [&str; 9] = [
    ";   Message Number",
    ";   |         Time Offset (ms)",
    ";   |         |        Type",
    ";   |         |        |        ID (hex)",
    ";   |         |        |        |     Data Length",
    ";   |         |        |        |     |   Data Bytes (hex) ...",
    ";   |         |        |        |     |   |",
    ";---+--   ----+----  --+--  ----+---  +  -+ -- -- -- -- -- -- --",
    "",
];

/// Session metadata written at the top of the trace
#[derive(Debug, Clone)]
pub struct TraceHeader {
    pub start_time: WallClock,
    pub bitrate: Bitrate,
    pub channel: String,
    pub generator: String,
    /// Session clock value that record offsets are measured from
    pub session_start_us: u64,
}

impl TraceHeader {
    pub fn new(channel: impl Into<String>, bitrate: Bitrate) -> Self {
        Self {
            start_time: Local::now(),
            bitrate,
            channel: channel.into(),
            generator: format!("can-trace v{}", crate::VERSION),
            session_start_us: 0,
        }
    }

    /// Builder method: set the generator name
    pub fn with_generator(mut self, generator: impl Into<String>) -> Self {
        self.generator = generator.into();
        self
    }

    /// Builder method: set the wall-clock start time
    pub fn with_start_time(mut self, start_time: WallClock) -> Self {
        self.start_time = start_time;
        self
    }

    /// Start time as an OLE automation date in local time, as PCAN tools expect
    pub fn start_time_days(&self) -> f64 {
        let millis = self.start_time.naive_local().and_utc().timestamp_millis();
        OLE_UNIX_EPOCH_DAYS + millis as f64 / MILLIS_PER_DAY
    }

    /// Header block lines
    pub fn render(&self) -> Vec<String> {
        let mut lines = vec![
            format!(";$FILEVERSION={}", FILE_VERSION),
            format!(";$STARTTIME={:.10}", self.start_time_days()),
            ";".to_string(),
            format!(
                ";   Start time: {}.0",
                self.start_time.format("%d-%m-%Y %H:%M:%S%.3f")
            ),
            format!(";   Generated by {}", self.generator),
            format!(";   Bitrate: {}", self.bitrate),
            format!(";   Channel: {}", self.channel),
            ";".to_string(),
        ];
        lines.extend(COLUMN_LEGEND.iter().filter(|l| !l.is_empty()).map(|l| l.to_string()));
        lines
    }
}

/// One rendered trace record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceLine {
    pub sequence: u64,
    pub session_timestamp_ms: f64,
    pub event: CanEvent,
    pub text: String,
}

/// Assigns sequence numbers and session timestamps, and streams records to a sink
///
/// Lines are handed to a dedicated writer thread; [`record`](Self::record) never waits
/// on sink I/O for longer than the backpressure limit.
pub struct TraceRecorder {
    worker: SinkWorker,
    session_start_us: u64,
    next_sequence: u64,
    last_timestamp_us: Option<u64>,
    jitter_clamps: u64,
    backpressure_limit: Option<Duration>,
    finished: bool,
}

impl TraceRecorder {
    /// Create a recorder without a backpressure limit and queue the header block
    pub fn new(sink: Box<dyn TraceSink>, header: &TraceHeader) -> Result<Self, SinkError> {
        Self::spawn(sink, header, None, None)
    }

    /// Create a recorder and queue the header block
    ///
    /// Writes in flight (or queue space) longer than `backpressure_limit` are reported
    /// as `BackpressureTimeout`. `listener` runs on the writer thread once a record line
    /// has reached the sink.
    pub fn spawn(
        sink: Box<dyn TraceSink>,
        header: &TraceHeader,
        backpressure_limit: Option<Duration>,
        listener: Option<RecordListener>,
    ) -> Result<Self, SinkError> {
        let worker = SinkWorker::spawn(sink, listener)?;
        for line in header.render() {
            worker.submit_header(line, backpressure_limit)?;
        }

        Ok(Self {
            worker,
            session_start_us: header.session_start_us,
            next_sequence: 1,
            last_timestamp_us: None,
            jitter_clamps: 0,
            backpressure_limit,
            finished: false,
        })
    }

    pub fn backpressure_limit(&self) -> Option<Duration> {
        self.backpressure_limit
    }

    /// Render and queue one event
    ///
    /// A device timestamp earlier than the previous record's is clamped to it and
    /// counted in [`jitter_clamps`](Self::jitter_clamps). Fails when the writer has
    /// failed, when a write has been stuck past the backpressure limit, or when the
    /// queue stays full for that long; the sequence does not advance on failure.
    pub fn record(&mut self, event: CanEvent) -> Result<TraceLine, SinkError> {
        let mut timestamp_us = event.timestamp_us();
        let mut clamped = false;
        if let Some(last) = self.last_timestamp_us {
            if timestamp_us < last {
                log::debug!(
                    "Clamping backward timestamp for 0x{}: {} us < {} us",
                    event.id(),
                    timestamp_us,
                    last
                );
                timestamp_us = last;
                clamped = true;
            }
        }

        let sequence = self.next_sequence;
        let session_timestamp_ms =
            timestamp_us.saturating_sub(self.session_start_us) as f64 / 1000.0;
        let line = TraceLine {
            sequence,
            session_timestamp_ms,
            event,
            text: format_record(sequence, session_timestamp_ms, &event),
        };

        self.worker
            .submit_record(line.clone(), self.backpressure_limit)?;

        self.next_sequence += 1;
        self.last_timestamp_us = Some(timestamp_us);
        if clamped {
            self.jitter_clamps += 1;
        }
        log::trace!("{}", line.text);
        Ok(line)
    }

    /// Surface a failed or stuck write without recording anything
    pub fn check(&self) -> Result<(), SinkError> {
        self.worker.check(self.backpressure_limit)
    }

    /// Best-effort flush of buffered lines; does not wait for the writer
    pub fn flush(&mut self) -> Result<(), SinkError> {
        self.worker.request_flush()
    }

    /// Drain queued lines, flush and fsync the trace; later calls do nothing
    ///
    /// Format v1.1 has no footer.
    pub fn finish(&mut self) -> Result<(), SinkError> {
        self.finish_within(None)
    }

    /// Like [`finish`](Self::finish), but gives up on the writer after `deadline`
    pub fn finish_within(&mut self, deadline: Option<Duration>) -> Result<(), SinkError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.worker.finish(deadline)?;
        log::info!("Trace finalized with {} records", self.lines_written());
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Records that reached the sink
    pub fn lines_written(&self) -> u64 {
        self.worker.written()
    }

    /// Records accepted for writing (written or still queued)
    pub fn lines_recorded(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Backward timestamps clamped so far
    pub fn jitter_clamps(&self) -> u64 {
        self.jitter_clamps
    }
}

/// Render one v1.1 record line
pub fn format_record(sequence: u64, session_timestamp_ms: f64, event: &CanEvent) -> String {
    let data = if event.is_remote() {
        "RTR".to_string()
    } else {
        event.data().to_hex()
    };
    let line = format!(
        "{:>6}) {:>11.1}  {:<5} {:<8} {}  {}",
        sequence,
        session_timestamp_ms,
        event.direction().marker(),
        event.id().to_hex(),
        event.dlc(),
        data
    );
    line.trim_end().to_string()
}
