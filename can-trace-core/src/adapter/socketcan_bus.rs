//! SocketCAN adapter (Linux only)
//!
//! PCAN, Kvaser and USBCAN devices all register as SocketCAN network interfaces
//! under their mainline drivers, so one raw-socket backend serves every vendor kind.
//! The interface bitrate is configured outside the recorder (`ip link set can0 type
//! can bitrate 500000`); the requested bitrate is validated and logged only.
//!
//! Timestamps are host-side: microseconds since open, sampled with a monotonic clock
//! when `read_frame` returns. They carry scheduling latency, and frames drained in
//! one burst get near-equal stamps. Kernel receive timestamps (`SO_TIMESTAMP`) are
//! not exposed by the `socketcan` crate's frame API.

use super::{
    AdapterHandle, AdapterKind, CanAdapter, DeviceTimestamp, FrameKind, IdEncoding, Received,
    VendorFrame,
};
use crate::types::{AdapterError, Bitrate};
use socketcan::{CanSocket, EmbeddedFrame, Frame, Socket};
use std::io;
use std::time::{Duration, Instant};

// Linux errno values the kernel reports for CAN interfaces
const ENXIO: i32 = 6;
const ENODEV: i32 = 19;
const ENETDOWN: i32 = 100;

// SocketCAN error class for bus-off (linux/can/error.h)
const CAN_ERR_BUSOFF: u32 = 0x0000_0040;

/// Raw SocketCAN backend
pub struct SocketCanAdapter {
    kind: AdapterKind,
}

impl SocketCanAdapter {
    pub fn new(kind: AdapterKind) -> Self {
        Self { kind }
    }
}

impl CanAdapter for SocketCanAdapter {
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    fn open(
        &mut self,
        channel: &str,
        bitrate: Bitrate,
    ) -> Result<Box<dyn AdapterHandle>, AdapterError> {
        let socket = CanSocket::open(channel).map_err(|e| {
            let e: io::Error = e.into();
            match e.raw_os_error() {
                Some(ENODEV) | Some(ENXIO) => AdapterError::HardwareNotFound {
                    channel: channel.to_string(),
                },
                _ => AdapterError::Io {
                    channel: channel.to_string(),
                    source: e,
                },
            }
        })?;

        log::info!(
            "{} opened on SocketCAN interface {} (bitrate {} expected on the interface)",
            self.kind,
            channel,
            bitrate
        );

        Ok(Box::new(SocketCanHandle {
            socket,
            channel: channel.to_string(),
            epoch: Instant::now(),
            read_timeout: None,
            closed: false,
        }))
    }
}

struct SocketCanHandle {
    socket: CanSocket,
    channel: String,
    epoch: Instant,
    read_timeout: Option<Duration>,
    closed: bool,
}

impl SocketCanHandle {
    fn classify(&self, e: io::Error) -> Result<Received, AdapterError> {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => return Ok(Received::Timeout),
            _ => {}
        }
        let channel = self.channel.clone();
        Err(match e.raw_os_error() {
            Some(ENETDOWN) => AdapterError::BusOff { channel },
            Some(ENODEV) | Some(ENXIO) => AdapterError::Disconnected { channel },
            _ => AdapterError::Io { channel, source: e },
        })
    }
}

impl AdapterHandle for SocketCanHandle {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn clock_origin(&self) -> DeviceTimestamp {
        DeviceTimestamp::Micros(0)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Received, AdapterError> {
        if self.closed {
            return Err(AdapterError::Disconnected {
                channel: self.channel.clone(),
            });
        }

        if self.read_timeout != Some(timeout) {
            if let Err(e) = self.socket.set_read_timeout(timeout) {
                return Err(AdapterError::Io {
                    channel: self.channel.clone(),
                    source: e,
                });
            }
            self.read_timeout = Some(timeout);
        }

        let frame = match self.socket.read_frame() {
            Ok(frame) => frame,
            Err(e) => return self.classify(e),
        };
        // Host receive time, not a controller timestamp
        let timestamp = DeviceTimestamp::Micros(self.epoch.elapsed().as_micros() as u64);

        let raw_id = Frame::raw_id(&frame);
        let kind = if Frame::is_error_frame(&frame) {
            if raw_id & CAN_ERR_BUSOFF != 0 {
                return Err(AdapterError::BusOff {
                    channel: self.channel.clone(),
                });
            }
            FrameKind::Error
        } else if EmbeddedFrame::is_remote_frame(&frame) {
            FrameKind::Remote
        } else {
            FrameKind::Data
        };

        let payload = EmbeddedFrame::data(&frame);
        let mut data = [0u8; 8];
        let copied = payload.len().min(8);
        data[..copied].copy_from_slice(&payload[..copied]);

        log::trace!("SocketCAN {} frame 0x{:X} ({} bytes)", self.channel, raw_id, payload.len());

        Ok(Received::Frame(VendorFrame {
            id_word: raw_id,
            encoding: IdEncoding::Separate {
                extended: EmbeddedFrame::is_extended(&frame),
            },
            dlc: EmbeddedFrame::dlc(&frame) as u8,
            data,
            timestamp,
            kind,
            transmitted: false,
        }))
    }

    fn close(&mut self) {
        // The socket itself is released when the handle is dropped
        if !self.closed {
            self.closed = true;
            log::info!("SocketCAN interface {} closed", self.channel);
        }
    }
}
