//! Adapter layer
//!
//! Every vendor transport sits behind the same two traits:
//! - [`CanAdapter`] is the configured capability that opens a channel
//! - [`AdapterHandle`] is the open channel that frames are polled from
//!
//! All hardware I/O is isolated in the implementations below; the rest of the crate
//! only sees [`VendorFrame`]s and [`AdapterError`]s.
//!
//! # Example
//!
//! ```
//! use can_trace_core::adapter::{create_adapter, AdapterKind};
//! use can_trace_core::{AdapterConfig, Bitrate};
//!
//! let config = AdapterConfig::new(AdapterKind::Virtual).with_bitrate(Bitrate::Kbps500);
//! let mut adapter = create_adapter(&config).unwrap();
//! let handle = adapter.open(&config.channel_or_default(), config.bitrate).unwrap();
//! assert_eq!(handle.channel(), "vcan0");
//! ```

use crate::config::AdapterConfig;
use crate::types::{AdapterError, Bitrate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

mod virtual_bus;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
mod socketcan_bus;

pub use virtual_bus::{VirtualAdapter, VirtualBus, VirtualFault};

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use socketcan_bus::SocketCanAdapter;

/// Adapter families known to the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// PEAK-System PCAN
    Pcan,
    /// Kvaser
    Kvaser,
    /// Chuangxin USBCAN / CANalyst-II
    Usbcan,
    /// In-process virtual bus
    Virtual,
    /// Any Linux SocketCAN interface
    Socketcan,
}

impl AdapterKind {
    /// Channel used when the configuration does not name one
    ///
    /// With the SocketCAN backend the vendor kinds are reached through their kernel
    /// drivers, so they default to the first CAN interface.
    pub fn default_channel(&self) -> &'static str {
        match self {
            AdapterKind::Virtual => "vcan0",
            AdapterKind::Socketcan => "can0",
            _ if cfg!(all(target_os = "linux", feature = "socketcan")) => "can0",
            AdapterKind::Pcan => "PCAN_USBBUS1",
            AdapterKind::Kvaser | AdapterKind::Usbcan => "0",
        }
    }

    /// Name of the driver stack the adapter needs
    pub fn driver_name(&self) -> &'static str {
        match self {
            AdapterKind::Pcan => "pcan",
            AdapterKind::Kvaser => "kvaser",
            AdapterKind::Usbcan => "canalystii",
            AdapterKind::Virtual => "virtual",
            AdapterKind::Socketcan => "socketcan",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterKind::Pcan => "Peak CAN",
            AdapterKind::Kvaser => "Kvaser CAN",
            AdapterKind::Usbcan => "Chuangxin USBCAN",
            AdapterKind::Virtual => "Virtual CAN",
            AdapterKind::Socketcan => "SocketCAN",
        };
        f.write_str(name)
    }
}

/// How a vendor encodes the frame format in its identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdEncoding {
    /// SocketCAN style: bit 31 extended, bit 30 remote, bit 29 error
    FlagBits,
    /// Plain identifier with the format reported separately
    Separate { extended: bool },
}

/// Device timestamp in the vendor's native representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTimestamp {
    Micros(u64),
    Nanos(u64),
    /// PCAN-Basic `TPCANTimestamp`
    Pcan {
        millis: u32,
        millis_overflow: u16,
        micros: u16,
    },
    /// Free running hardware counter
    Ticks { ticks: u64, frequency_hz: u64 },
}

impl DeviceTimestamp {
    /// Absolute device time in microseconds
    pub fn as_micros(&self) -> u64 {
        match *self {
            DeviceTimestamp::Micros(us) => us,
            DeviceTimestamp::Nanos(ns) => ns / 1_000,
            DeviceTimestamp::Pcan {
                millis,
                millis_overflow,
                micros,
            } => {
                micros as u64
                    + 1_000 * millis as u64
                    + 0x1_0000_0000u64 * 1_000 * millis_overflow as u64
            }
            DeviceTimestamp::Ticks {
                ticks,
                frequency_hz,
            } => {
                if frequency_hz == 0 {
                    0
                } else {
                    (ticks as u128 * 1_000_000 / frequency_hz as u128) as u64
                }
            }
        }
    }
}

/// What the vendor reported the frame to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Remote,
    Error,
}

/// A frame as delivered by a vendor transport, before normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorFrame {
    pub id_word: u32,
    pub encoding: IdEncoding,
    /// DLC as reported by the hardware, not yet validated
    pub dlc: u8,
    pub data: [u8; 8],
    pub timestamp: DeviceTimestamp,
    pub kind: FrameKind,
    /// True for frames this node transmitted (echo)
    pub transmitted: bool,
}

impl VendorFrame {
    /// Received data frame with a separately flagged identifier
    ///
    /// At most 8 bytes are copied; the reported DLC is `data.len()` regardless, so
    /// oversized input is caught by the normalizer.
    pub fn new(id: u32, extended: bool, data: &[u8], timestamp: DeviceTimestamp) -> Self {
        let mut bytes = [0u8; 8];
        let copied = data.len().min(8);
        bytes[..copied].copy_from_slice(&data[..copied]);

        Self {
            id_word: id,
            encoding: IdEncoding::Separate { extended },
            dlc: data.len().min(u8::MAX as usize) as u8,
            data: bytes,
            timestamp,
            kind: FrameKind::Data,
            transmitted: false,
        }
    }

    /// Builder method: override the reported DLC
    pub fn with_dlc(mut self, dlc: u8) -> Self {
        self.dlc = dlc;
        self
    }

    /// Builder method: mark as a remote request
    pub fn remote(mut self) -> Self {
        self.kind = FrameKind::Remote;
        self
    }

    /// Builder method: mark as an error frame
    pub fn error(mut self) -> Self {
        self.kind = FrameKind::Error;
        self
    }

    /// Builder method: mark as transmitted by this node
    pub fn transmitted(mut self) -> Self {
        self.transmitted = true;
        self
    }
}

/// Result of one poll of an open adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Frame(VendorFrame),
    /// No frame arrived within the timeout (not an error)
    Timeout,
}

/// Configured adapter capability, one implementation per vendor
pub trait CanAdapter: Send {
    fn kind(&self) -> AdapterKind;

    /// Open a channel at the given bitrate
    ///
    /// Fails with `HardwareNotFound`, `DriverMissing` or `BitrateUnsupported`.
    fn open(&mut self, channel: &str, bitrate: Bitrate)
        -> Result<Box<dyn AdapterHandle>, AdapterError>;
}

/// An open adapter channel
pub trait AdapterHandle: Send {
    fn channel(&self) -> &str;

    /// Device timestamp captured when the channel was opened
    fn clock_origin(&self) -> DeviceTimestamp;

    /// Block up to `timeout` for the next frame
    fn receive(&mut self, timeout: Duration) -> Result<Received, AdapterError>;

    /// Release vendor resources. Must be idempotent.
    fn close(&mut self);
}

/// Scoped owner of an open adapter handle
///
/// The handle is closed exactly once: on the first `close()` call or on drop,
/// including drops during unwinding.
pub struct OpenAdapter {
    handle: Box<dyn AdapterHandle>,
    closed: bool,
}

impl OpenAdapter {
    pub fn new(handle: Box<dyn AdapterHandle>) -> Self {
        Self {
            handle,
            closed: false,
        }
    }

    pub fn channel(&self) -> &str {
        self.handle.channel()
    }

    pub fn clock_origin(&self) -> DeviceTimestamp {
        self.handle.clock_origin()
    }

    pub fn receive(&mut self, timeout: Duration) -> Result<Received, AdapterError> {
        if self.closed {
            return Err(AdapterError::Disconnected {
                channel: self.handle.channel().to_string(),
            });
        }
        self.handle.receive(timeout)
    }

    pub fn close(&mut self) {
        if !self.closed {
            log::debug!("Closing adapter channel {}", self.handle.channel());
            self.handle.close();
            self.closed = true;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for OpenAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create the adapter selected by the configuration
pub fn create_adapter(config: &AdapterConfig) -> Result<Box<dyn CanAdapter>, AdapterError> {
    match config.kind {
        AdapterKind::Virtual => {
            let bus = VirtualBus::new(config.channel_or_default());
            Ok(Box::new(VirtualAdapter::new(bus)))
        }
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        kind => Ok(Box::new(SocketCanAdapter::new(kind))),
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        kind => {
            log::error!(
                "{} requires the SocketCAN backend (Linux, 'socketcan' feature)",
                kind
            );
            Err(AdapterError::DriverMissing {
                driver: kind.driver_name().to_string(),
            })
        }
    }
}
