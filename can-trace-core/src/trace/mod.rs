//! PCAN `.TRC` v1.1 trace files
//!
//! The writer side ([`TraceRecorder`] over a [`TraceSink`]) streams one line per
//! event through a dedicated writer thread. The reader side ([`TraceReader`]) parses v1.1
//! files back into [`TraceRecord`]s.

pub mod reader;
pub mod sink;
pub mod writer;
mod worker;

pub use reader::{TraceFile, TraceReader, TraceRecord};
pub use sink::{FileSink, MemorySink, TraceSink};
pub use worker::RecordListener;
pub use writer::{TraceHeader, TraceLine, TraceRecorder};

/// Trace file version written by the recorder
pub const FILE_VERSION: &str = "1.1";
