//! Core types for the CAN trace recorder
//!
//! This module defines the canonical event model every pipeline stage works with,
//! the supported bitrates, and the error taxonomy shared by adapters, the trace
//! writer and the session controller.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Wall-clock timestamp type (only used for headers and fault reports)
pub type WallClock = DateTime<Local>;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// CAN identifier with the frame format kept separate from the value
///
/// The extended flag is never folded into the numeric id, so `0x100` standard and
/// `0x100` extended are different identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanId {
    raw: u32,
    extended: bool,
}

impl CanId {
    /// Largest 11-bit identifier
    pub const STANDARD_MAX: u32 = 0x7FF;
    /// Largest 29-bit identifier
    pub const EXTENDED_MAX: u32 = 0x1FFF_FFFF;

    /// Create an identifier, returning `None` if `raw` exceeds the format's range
    pub fn new(raw: u32, extended: bool) -> Option<Self> {
        let max = if extended { Self::EXTENDED_MAX } else { Self::STANDARD_MAX };
        (raw <= max).then_some(Self { raw, extended })
    }

    /// Create an 11-bit identifier
    pub fn standard(raw: u32) -> Option<Self> {
        Self::new(raw, false)
    }

    /// Create a 29-bit identifier
    pub fn extended(raw: u32) -> Option<Self> {
        Self::new(raw, true)
    }

    /// Numeric identifier value (without any format flag)
    pub fn raw(&self) -> u32 {
        self.raw
    }

    /// True for 29-bit identifiers
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Uppercase hex, zero-padded to 3 digits (standard) or 8 digits (extended)
    pub fn to_hex(&self) -> String {
        if self.extended {
            format!("{:08X}", self.raw)
        } else {
            format!("{:03X}", self.raw)
        }
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Fixed-capacity classic CAN payload (0-8 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Payload {
    bytes: [u8; 8],
    len: u8,
}

impl Payload {
    /// Maximum number of data bytes in a classic CAN frame
    pub const CAPACITY: usize = 8;

    /// Copy `data` into a payload, `None` if it is longer than 8 bytes
    pub fn new(data: &[u8]) -> Option<Self> {
        if data.len() > Self::CAPACITY {
            return None;
        }
        let mut bytes = [0u8; 8];
        bytes[..data.len()].copy_from_slice(data);
        Some(Self {
            bytes,
            len: data.len() as u8,
        })
    }

    /// Valid data bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Space separated uppercase hex pairs, e.g. `"01 A2 FF"`
    pub fn to_hex(&self) -> String {
        self.as_slice()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.to_hex())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.as_slice())
    }
}

/// Direction of a bus event as seen from the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Rx,
    Tx,
    ErrorFrame,
}

impl Direction {
    /// Direction marker used in the trace file
    pub fn marker(&self) -> &'static str {
        match self {
            Direction::Rx => "Rx",
            Direction::Tx => "Tx",
            Direction::ErrorFrame => "Error",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Rx" => Ok(Direction::Rx),
            "Tx" => Ok(Direction::Tx),
            "Error" => Ok(Direction::ErrorFrame),
            other => Err(format!("unknown direction marker: {}", other)),
        }
    }
}

/// Canonical CAN event produced by the normalizer
///
/// Immutable once constructed. `timestamp_us` is on the session clock: microseconds
/// since the adapter was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CanEvent {
    id: CanId,
    dlc: u8,
    data: Payload,
    timestamp_us: u64,
    direction: Direction,
    remote: bool,
}

impl CanEvent {
    /// Data (or error) frame; the DLC is the payload length
    pub fn new(id: CanId, data: Payload, timestamp_us: u64, direction: Direction) -> Self {
        Self {
            id,
            dlc: data.len() as u8,
            data,
            timestamp_us,
            direction,
            remote: false,
        }
    }

    /// Remote transmission request: carries a DLC but no data bytes
    pub fn remote(id: CanId, dlc: u8, timestamp_us: u64, direction: Direction) -> Option<Self> {
        (dlc as usize <= Payload::CAPACITY).then_some(Self {
            id,
            dlc,
            data: Payload::default(),
            timestamp_us,
            direction,
            remote: true,
        })
    }

    pub fn id(&self) -> CanId {
        self.id
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }
}

/// Supported CAN bus bitrates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bitrate {
    #[serde(rename = "125k")]
    Kbps125,
    #[serde(rename = "250k")]
    Kbps250,
    #[serde(rename = "500k")]
    Kbps500,
    #[serde(rename = "1M")]
    Mbps1,
}

impl Bitrate {
    /// All supported bitrates, slowest first
    pub const ALL: [Bitrate; 4] = [
        Bitrate::Kbps125,
        Bitrate::Kbps250,
        Bitrate::Kbps500,
        Bitrate::Mbps1,
    ];

    pub fn bits_per_second(&self) -> u32 {
        match self {
            Bitrate::Kbps125 => 125_000,
            Bitrate::Kbps250 => 250_000,
            Bitrate::Kbps500 => 500_000,
            Bitrate::Mbps1 => 1_000_000,
        }
    }

    /// Map a raw bit/s value onto a supported bitrate
    pub fn from_bps(bps: u32) -> std::result::Result<Self, AdapterError> {
        Self::ALL
            .into_iter()
            .find(|b| b.bits_per_second() == bps)
            .ok_or(AdapterError::BitrateUnsupported { bitrate_bps: bps })
    }
}

impl Default for Bitrate {
    fn default() -> Self {
        Bitrate::Kbps500
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bitrate::Mbps1 => write!(f, "1000 kbit/s"),
            other => write!(f, "{} kbit/s", other.bits_per_second() / 1000),
        }
    }
}

impl FromStr for Bitrate {
    type Err = AdapterError;

    /// Accepts `"500k"`, `"500 kbps"`, `"500000"`, `"1M"`, `"1 Mbps"`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        let unparsable = || AdapterError::BitrateUnsupported { bitrate_bps: 0 };

        let (digits, multiplier) = if let Some(rest) = normalized
            .strip_suffix("kbps")
            .or_else(|| normalized.strip_suffix("kbit/s"))
            .or_else(|| normalized.strip_suffix('k'))
        {
            (rest, 1_000)
        } else if let Some(rest) = normalized
            .strip_suffix("mbps")
            .or_else(|| normalized.strip_suffix("mbit/s"))
            .or_else(|| normalized.strip_suffix('m'))
        {
            (rest, 1_000_000)
        } else {
            (normalized.as_str(), 1)
        };

        let value: u32 = digits.parse().map_err(|_| unparsable())?;
        let bps = value.checked_mul(multiplier).ok_or_else(unparsable)?;
        Self::from_bps(bps)
    }
}

/// Errors reported by adapter implementations
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("CAN hardware not found on channel {channel}")]
    HardwareNotFound { channel: String },

    #[error("Driver missing for {driver} adapter")]
    DriverMissing { driver: String },

    #[error("Bitrate not supported: {bitrate_bps} bit/s")]
    BitrateUnsupported { bitrate_bps: u32 },

    #[error("Bus-off on channel {channel}")]
    BusOff { channel: String },

    #[error("Adapter disconnected from channel {channel}")]
    Disconnected { channel: String },

    #[error("I/O error on channel {channel}: {source}")]
    Io {
        channel: String,
        #[source]
        source: std::io::Error,
    },
}

impl AdapterError {
    /// Only disconnects are retried; everything else points at a setup problem
    pub fn is_retriable(&self) -> bool {
        matches!(self, AdapterError::Disconnected { .. })
    }

    /// Fault reason recorded when this error ends a session
    pub fn fault_reason(&self) -> FaultReason {
        match self {
            AdapterError::HardwareNotFound { .. } => FaultReason::HardwareNotFound,
            AdapterError::DriverMissing { .. } => FaultReason::DriverMissing,
            AdapterError::BitrateUnsupported { .. } => FaultReason::BitrateUnsupported,
            AdapterError::BusOff { .. } => FaultReason::BusOff,
            AdapterError::Disconnected { .. } => FaultReason::Disconnected,
            AdapterError::Io { .. } => FaultReason::AdapterIo,
        }
    }
}

/// Errors raised while normalizing a vendor frame (frame is dropped, capture continues)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid DLC {dlc} for CAN ID 0x{id:X} at {timestamp_us} us")]
    InvalidDlc { id: u32, dlc: u8, timestamp_us: u64 },

    #[error("Invalid {} CAN ID 0x{raw:X} at {timestamp_us} us", id_kind(.extended))]
    InvalidId {
        raw: u32,
        extended: bool,
        timestamp_us: u64,
    },
}

fn id_kind(extended: &bool) -> &'static str {
    if *extended {
        "extended"
    } else {
        "standard"
    }
}

/// Errors raised by the trace sink
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Trace write failed{}: {source}", sequence_suffix(.sequence))]
    WriteFailed {
        sequence: Option<u64>,
        #[source]
        source: std::io::Error,
    },

    #[error("Trace sink blocked for {elapsed:?} (limit {threshold:?}) writing line {sequence}")]
    BackpressureTimeout {
        sequence: u64,
        elapsed: Duration,
        threshold: Duration,
    },
}

fn sequence_suffix(sequence: &Option<u64>) -> String {
    match sequence {
        Some(seq) => format!(" at line {}", seq),
        None => String::new(),
    }
}

impl SinkError {
    pub fn fault_reason(&self) -> FaultReason {
        match self {
            SinkError::WriteFailed { .. } => FaultReason::SinkWriteFailed,
            SinkError::BackpressureTimeout { .. } => FaultReason::SinkBackpressure,
        }
    }
}

/// Errors raised while reading a trace file back
#[derive(Debug, thiserror::Error)]
pub enum TraceParseError {
    #[error("Failed to read trace file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported trace file version: {0}")]
    UnsupportedVersion(String),

    #[error("Invalid trace record on line {line}: {reason}")]
    InvalidRecord { line: usize, reason: String },
}

/// Errors returned by the session controller
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Trace sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Cannot {action} while session is {state}")]
    InvalidTransition {
        action: &'static str,
        state: SessionState,
    },

    #[error("Capture thread failure: {0}")]
    CaptureThread(String),
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Recording,
    Paused,
    Stopped,
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting",
            SessionState::Recording => "Recording",
            SessionState::Paused => "Paused",
            SessionState::Stopped => "Stopped",
            SessionState::Faulted => "Faulted",
        };
        f.write_str(name)
    }
}

/// Why a session ended up Faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FaultReason {
    HardwareNotFound,
    DriverMissing,
    BitrateUnsupported,
    BusOff,
    Disconnected,
    AdapterIo,
    SinkWriteFailed,
    SinkBackpressure,
    CaptureThread,
}

/// Operator-facing description of a session fault
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionFault {
    pub reason: FaultReason,
    /// Rendered error message, suitable for showing verbatim
    pub message: String,
    pub at: WallClock,
    /// Session clock of the last event seen before the fault
    pub last_timestamp_us: Option<u64>,
    pub last_id: Option<CanId>,
}

impl fmt::Display for SessionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.reason, self.message)?;
        if let (Some(ts), Some(id)) = (self.last_timestamp_us, self.last_id) {
            write!(f, " (last frame 0x{} at {} us)", id, ts)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_id_ranges() {
        assert!(CanId::standard(0x7FF).is_some());
        assert!(CanId::standard(0x800).is_none());
        assert!(CanId::extended(0x1FFF_FFFF).is_some());
        assert!(CanId::extended(0x2000_0000).is_none());
        assert_ne!(CanId::standard(0x100), CanId::extended(0x100));
    }

    #[test]
    fn test_can_id_hex_padding() {
        assert_eq!(CanId::standard(0x1).unwrap().to_hex(), "001");
        assert_eq!(CanId::standard(0x7AB).unwrap().to_hex(), "7AB");
        assert_eq!(CanId::extended(0x18DAF1).unwrap().to_hex(), "0018DAF1");
    }

    #[test]
    fn test_payload_limits() {
        assert!(Payload::new(&[0; 9]).is_none());
        let payload = Payload::new(&[0x01, 0xA2, 0xFF]).unwrap();
        assert_eq!(payload.len(), 3);
        assert_eq!(payload.to_hex(), "01 A2 FF");
        assert!(Payload::new(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_bitrate_parsing() {
        assert_eq!("500k".parse::<Bitrate>().unwrap(), Bitrate::Kbps500);
        assert_eq!("125 kbps".parse::<Bitrate>().unwrap(), Bitrate::Kbps125);
        assert_eq!("250000".parse::<Bitrate>().unwrap(), Bitrate::Kbps250);
        assert_eq!("1M".parse::<Bitrate>().unwrap(), Bitrate::Mbps1);
        assert_eq!("1 Mbps".parse::<Bitrate>().unwrap(), Bitrate::Mbps1);

        match "83.3k".parse::<Bitrate>() {
            Err(AdapterError::BitrateUnsupported { .. }) => {}
            other => panic!("expected BitrateUnsupported, got {:?}", other),
        }
        match Bitrate::from_bps(33_333) {
            Err(AdapterError::BitrateUnsupported { bitrate_bps }) => assert_eq!(bitrate_bps, 33_333),
            other => panic!("expected BitrateUnsupported, got {:?}", other),
        }
    }

    #[test]
    fn test_remote_event_has_no_data() {
        let id = CanId::standard(0x321).unwrap();
        let event = CanEvent::remote(id, 4, 10, Direction::Rx).unwrap();
        assert!(event.is_remote());
        assert_eq!(event.dlc(), 4);
        assert!(event.data().is_empty());
        assert!(CanEvent::remote(id, 9, 10, Direction::Rx).is_none());
    }

    #[test]
    fn test_only_disconnect_is_retriable() {
        let channel = "vcan0".to_string();
        assert!(AdapterError::Disconnected { channel: channel.clone() }.is_retriable());
        assert!(!AdapterError::BusOff { channel }.is_retriable());
    }
}
