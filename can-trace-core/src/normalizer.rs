//! Frame normalization
//!
//! Converts vendor-native [`VendorFrame`]s into canonical [`CanEvent`]s: one id
//! representation, a validated DLC, and timestamps on the session clock.

use crate::adapter::{DeviceTimestamp, FrameKind, IdEncoding, VendorFrame};
use crate::types::{CanEvent, CanId, Direction, FrameError, Payload};

const CAN_EFF_FLAG: u32 = 0x8000_0000;
const CAN_RTR_FLAG: u32 = 0x4000_0000;
const CAN_ERR_FLAG: u32 = 0x2000_0000;
const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// Reference point for rebasing device timestamps onto the session clock
///
/// `device_us` is the device time captured when the adapter was opened;
/// `session_offset_us` is where that instant sits on the session clock (zero for the
/// first open, later for reconnects).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockOrigin {
    pub device_us: u64,
    pub session_offset_us: u64,
}

impl ClockOrigin {
    pub fn at(device: DeviceTimestamp) -> Self {
        Self {
            device_us: device.as_micros(),
            session_offset_us: 0,
        }
    }

    /// Builder method: place this origin later on the session clock
    pub fn with_session_offset(mut self, offset_us: u64) -> Self {
        self.session_offset_us = offset_us;
        self
    }

    /// Device time → microseconds on the session clock
    ///
    /// Device times before the origin saturate at the origin.
    pub fn rebase(&self, device: DeviceTimestamp) -> u64 {
        self.session_offset_us + device.as_micros().saturating_sub(self.device_us)
    }
}

/// Normalize a vendor frame into a canonical event
pub fn normalize(frame: &VendorFrame, origin: &ClockOrigin) -> Result<CanEvent, FrameError> {
    let timestamp_us = origin.rebase(frame.timestamp);

    let (raw, extended, mut remote, mut error) = match frame.encoding {
        IdEncoding::FlagBits => {
            let extended = frame.id_word & CAN_EFF_FLAG != 0;
            let masked = if extended {
                frame.id_word & CAN_EFF_MASK
            } else {
                frame.id_word & CanId::STANDARD_MAX
            };
            (
                masked,
                extended,
                frame.id_word & CAN_RTR_FLAG != 0,
                frame.id_word & CAN_ERR_FLAG != 0,
            )
        }
        IdEncoding::Separate { extended } => (frame.id_word, extended, false, false),
    };
    remote |= frame.kind == FrameKind::Remote;
    error |= frame.kind == FrameKind::Error;

    if frame.dlc as usize > Payload::CAPACITY {
        return Err(FrameError::InvalidDlc {
            id: raw,
            dlc: frame.dlc,
            timestamp_us,
        });
    }

    // Error frames carry an error class instead of an arbitration id
    let id = if error {
        CanId::new(raw & CAN_EFF_MASK, raw > CanId::STANDARD_MAX)
    } else {
        CanId::new(raw, extended)
    };
    let id = id.ok_or(FrameError::InvalidId {
        raw,
        extended,
        timestamp_us,
    })?;

    let direction = if error {
        Direction::ErrorFrame
    } else if frame.transmitted {
        Direction::Tx
    } else {
        Direction::Rx
    };

    if remote && !error {
        return CanEvent::remote(id, frame.dlc, timestamp_us, direction).ok_or(
            FrameError::InvalidDlc {
                id: raw,
                dlc: frame.dlc,
                timestamp_us,
            },
        );
    }

    // dlc <= 8 was checked above
    let payload = Payload::new(&frame.data[..frame.dlc as usize]).unwrap_or_default();
    Ok(CanEvent::new(id, payload, timestamp_us, direction))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn micros(us: u64) -> DeviceTimestamp {
        DeviceTimestamp::Micros(us)
    }

    #[test]
    fn test_extended_flag_is_separate_from_id() {
        let frame = VendorFrame {
            id_word: CAN_EFF_FLAG | 0x18DA_F110,
            encoding: IdEncoding::FlagBits,
            dlc: 2,
            data: [0x3E, 0x00, 0, 0, 0, 0, 0, 0],
            timestamp: micros(0),
            kind: FrameKind::Data,
            transmitted: false,
        };
        let event = normalize(&frame, &ClockOrigin::default()).unwrap();
        assert_eq!(event.id().raw(), 0x18DA_F110);
        assert!(event.id().is_extended());
        assert_eq!(event.data().as_slice(), &[0x3E, 0x00]);
    }

    #[test]
    fn test_flag_bits_remote_request() {
        let frame = VendorFrame {
            id_word: CAN_RTR_FLAG | 0x123,
            encoding: IdEncoding::FlagBits,
            dlc: 4,
            data: [0xFF; 8],
            timestamp: micros(0),
            kind: FrameKind::Data,
            transmitted: false,
        };
        let event = normalize(&frame, &ClockOrigin::default()).unwrap();
        assert!(event.is_remote());
        assert!(!event.id().is_extended());
        assert_eq!(event.dlc(), 4);
        assert!(event.data().is_empty());
    }

    #[test]
    fn test_invalid_dlc_is_rejected() {
        let frame = VendorFrame::new(0x100, false, &[0u8; 8], micros(500)).with_dlc(9);
        let err = normalize(&frame, &ClockOrigin::default()).unwrap_err();
        assert_eq!(
            err,
            FrameError::InvalidDlc {
                id: 0x100,
                dlc: 9,
                timestamp_us: 500
            }
        );
    }

    #[test]
    fn test_out_of_range_standard_id() {
        let frame = VendorFrame::new(0x800, false, &[], micros(0));
        assert!(matches!(
            normalize(&frame, &ClockOrigin::default()),
            Err(FrameError::InvalidId { raw: 0x800, .. })
        ));
    }

    #[test]
    fn test_timestamp_rebased_to_origin() {
        let origin = ClockOrigin::at(DeviceTimestamp::Pcan {
            millis: 10,
            millis_overflow: 0,
            micros: 0,
        });
        let frame = VendorFrame::new(
            0x200,
            false,
            &[1, 2],
            DeviceTimestamp::Pcan {
                millis: 12,
                millis_overflow: 0,
                micros: 500,
            },
        );
        let event = normalize(&frame, &origin).unwrap();
        assert_eq!(event.timestamp_us(), 2_500);
    }

    #[test]
    fn test_reconnect_origin_keeps_session_clock() {
        // Device clock restarted at zero after a reconnect 5 s into the session
        let origin = ClockOrigin::at(micros(0)).with_session_offset(5_000_000);
        let frame = VendorFrame::new(0x200, false, &[], micros(1_000));
        assert_eq!(normalize(&frame, &origin).unwrap().timestamp_us(), 5_001_000);

        let before = VendorFrame::new(0x200, false, &[], micros(10));
        let late_origin = ClockOrigin::at(micros(100));
        assert_eq!(normalize(&before, &late_origin).unwrap().timestamp_us(), 0);
    }

    #[test]
    fn test_direction_mapping() {
        let tx = VendorFrame::new(0x10, false, &[0], micros(0)).transmitted();
        assert_eq!(
            normalize(&tx, &ClockOrigin::default()).unwrap().direction(),
            Direction::Tx
        );

        let err = VendorFrame::new(0x0000_0004, false, &[0; 8], micros(0)).error();
        let event = normalize(&err, &ClockOrigin::default()).unwrap();
        assert_eq!(event.direction(), Direction::ErrorFrame);
        assert_eq!(event.dlc(), 8);
    }
}
