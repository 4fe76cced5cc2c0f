//! CAN Trace Recording Core
//!
//! Records live CAN bus traffic from a hardware adapter into PCAN `.TRC` v1.1 trace
//! files while keeping per-id cycle statistics for display.
//!
//! # Architecture
//!
//! - `adapter`: vendor-neutral adapter contract plus a virtual bus and SocketCAN backend
//! - `normalizer`: vendor frames → canonical [`CanEvent`]s on the session clock
//! - `cycle`: per-id count, cycle time and last payload
//! - `trace`: ordered, sequence-numbered `.TRC` output (and a reader for it)
//! - `session`: lifecycle state machine and the capture thread
//! - `observer`: bounded, non-blocking notification feed for a UI
//!
//! The library does NOT decode signals, replay traces or render anything; the
//! application layer (can-trace-cli) handles presentation.
//!
//! # Example Usage
//!
//! ```no_run
//! use can_trace_core::adapter::create_adapter;
//! use can_trace_core::{AdapterConfig, Bitrate, FileSink, SessionConfig, SessionController};
//! use can_trace_core::adapter::AdapterKind;
//! use std::path::Path;
//!
//! let adapter_config = AdapterConfig::new(AdapterKind::Socketcan)
//!     .with_channel("can0")
//!     .with_bitrate(Bitrate::Kbps500);
//! let adapter = create_adapter(&adapter_config).unwrap();
//!
//! let mut session = SessionController::new(adapter, SessionConfig::new());
//! let sink = FileSink::create(Path::new("capture.trc")).unwrap();
//! session
//!     .start(&adapter_config.channel_or_default(), adapter_config.bitrate, Box::new(sink))
//!     .unwrap();
//!
//! // ... later
//! session.stop().unwrap();
//! for entry in session.cycle_stats() {
//!     println!("{} x{}", entry.id, entry.stat.count);
//! }
//! ```

// Public modules
pub mod adapter;
pub mod config;
pub mod cycle;
pub mod normalizer;
pub mod observer;
pub mod session;
pub mod trace;
pub mod types;

// Re-export main types for convenience
pub use adapter::{AdapterKind, CanAdapter, VirtualAdapter, VirtualBus};
pub use config::{AdapterConfig, SessionConfig};
pub use cycle::{CycleStat, CycleStatSnapshot, CycleTracker};
pub use normalizer::{normalize, ClockOrigin};
pub use observer::{Diagnostics, Notification, SessionStateChange};
pub use session::{SessionController, SessionInfo};
pub use trace::{
    FileSink, MemorySink, TraceFile, TraceHeader, TraceLine, TraceReader, TraceRecord,
    TraceRecorder, TraceSink,
};
pub use types::{
    AdapterError, Bitrate, CanEvent, CanId, Direction, FaultReason, FrameError, Payload,
    Result, SessionError, SessionFault, SessionState, SinkError, TraceParseError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
