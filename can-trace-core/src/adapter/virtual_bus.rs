//! In-process virtual CAN bus
//!
//! A [`VirtualBus`] is a cloneable injector shared between test code (or a traffic
//! simulator) and a [`VirtualAdapter`]. Frames and scripted faults pushed into the
//! bus are delivered, in order, by the open handle's `receive`.

use super::{AdapterHandle, AdapterKind, CanAdapter, DeviceTimestamp, Received, VendorFrame};
use crate::types::{AdapterError, Bitrate, CanId};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Hardware fault that can be scripted onto the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualFault {
    Disconnected,
    BusOff,
}

enum BusItem {
    Frame(VendorFrame),
    Fault(VirtualFault),
}

struct BusState {
    present: bool,
    supported_bitrates: Vec<Bitrate>,
    opened_with: Option<Bitrate>,
    opens: usize,
    closes: usize,
}

struct BusInner {
    channel: String,
    tx: Sender<BusItem>,
    rx: Receiver<BusItem>,
    epoch: Instant,
    manual_clock: bool,
    state: Mutex<BusState>,
}

/// Shared handle to a virtual bus
#[derive(Clone)]
pub struct VirtualBus {
    inner: Arc<BusInner>,
}

impl VirtualBus {
    /// Bus whose clock is the monotonic time since creation
    pub fn new(channel: impl Into<String>) -> Self {
        Self::build(channel.into(), false)
    }

    /// Bus whose clock origin is pinned at zero
    ///
    /// Frames sent with explicit timestamps then land on the session clock unchanged.
    pub fn manual_clock(channel: impl Into<String>) -> Self {
        Self::build(channel.into(), true)
    }

    fn build(channel: String, manual_clock: bool) -> Self {
        let (tx, rx) = unbounded();
        Self {
            inner: Arc::new(BusInner {
                channel,
                tx,
                rx,
                epoch: Instant::now(),
                manual_clock,
                state: Mutex::new(BusState {
                    present: true,
                    supported_bitrates: Bitrate::ALL.to_vec(),
                    opened_with: None,
                    opens: 0,
                    closes: 0,
                }),
            }),
        }
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Queue a vendor frame
    pub fn send(&self, frame: VendorFrame) {
        let _ = self.inner.tx.send(BusItem::Frame(frame));
    }

    /// Queue a received data frame stamped with the bus clock
    pub fn transmit(&self, id: CanId, data: &[u8]) {
        let frame = VendorFrame::new(id.raw(), id.is_extended(), data, self.now());
        self.send(frame);
    }

    /// Queue a hardware fault; it is reported by the next `receive` that reaches it
    pub fn inject_fault(&self, fault: VirtualFault) {
        let _ = self.inner.tx.send(BusItem::Fault(fault));
    }

    /// Simulate the device being unplugged (or present again)
    pub fn set_present(&self, present: bool) {
        self.inner.state.lock().present = present;
    }

    /// Restrict the bitrates the simulated controller accepts
    pub fn restrict_bitrates(&self, bitrates: &[Bitrate]) {
        self.inner.state.lock().supported_bitrates = bitrates.to_vec();
    }

    /// Bitrate of the most recent successful open
    pub fn opened_with(&self) -> Option<Bitrate> {
        self.inner.state.lock().opened_with
    }

    pub fn open_count(&self) -> usize {
        self.inner.state.lock().opens
    }

    pub fn close_count(&self) -> usize {
        self.inner.state.lock().closes
    }

    /// Frames and faults not yet consumed
    pub fn pending(&self) -> usize {
        self.inner.rx.len()
    }

    /// Current bus time
    pub fn now(&self) -> DeviceTimestamp {
        DeviceTimestamp::Micros(self.inner.epoch.elapsed().as_micros() as u64)
    }
}

/// Adapter implementation backed by a [`VirtualBus`]
pub struct VirtualAdapter {
    bus: VirtualBus,
}

impl VirtualAdapter {
    pub fn new(bus: VirtualBus) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &VirtualBus {
        &self.bus
    }
}

impl CanAdapter for VirtualAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Virtual
    }

    fn open(
        &mut self,
        channel: &str,
        bitrate: Bitrate,
    ) -> Result<Box<dyn AdapterHandle>, AdapterError> {
        let inner = &self.bus.inner;
        {
            let mut state = inner.state.lock();
            if !state.present || channel != inner.channel {
                return Err(AdapterError::HardwareNotFound {
                    channel: channel.to_string(),
                });
            }
            if !state.supported_bitrates.contains(&bitrate) {
                return Err(AdapterError::BitrateUnsupported {
                    bitrate_bps: bitrate.bits_per_second(),
                });
            }
            state.opens += 1;
            state.opened_with = Some(bitrate);
        }

        // Drop anything queued before the channel was opened
        let stale = inner.rx.try_iter().count();
        if stale > 0 {
            log::debug!("Drained {} stale items from virtual bus {}", stale, channel);
        }

        let origin = if inner.manual_clock {
            DeviceTimestamp::Micros(0)
        } else {
            self.bus.now()
        };

        log::info!("Virtual bus {} opened at {}", channel, bitrate);
        Ok(Box::new(VirtualHandle {
            bus: self.bus.clone(),
            origin,
            closed: false,
        }))
    }
}

struct VirtualHandle {
    bus: VirtualBus,
    origin: DeviceTimestamp,
    closed: bool,
}

impl VirtualHandle {
    fn disconnected(&self) -> AdapterError {
        AdapterError::Disconnected {
            channel: self.bus.inner.channel.clone(),
        }
    }
}

impl AdapterHandle for VirtualHandle {
    fn channel(&self) -> &str {
        &self.bus.inner.channel
    }

    fn clock_origin(&self) -> DeviceTimestamp {
        self.origin
    }

    fn receive(&mut self, timeout: Duration) -> Result<Received, AdapterError> {
        if self.closed {
            return Err(self.disconnected());
        }

        match self.bus.inner.rx.recv_timeout(timeout) {
            Ok(BusItem::Frame(frame)) => Ok(Received::Frame(frame)),
            Ok(BusItem::Fault(VirtualFault::Disconnected)) => Err(self.disconnected()),
            Ok(BusItem::Fault(VirtualFault::BusOff)) => Err(AdapterError::BusOff {
                channel: self.bus.inner.channel.clone(),
            }),
            Err(RecvTimeoutError::Timeout) => Ok(Received::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(self.disconnected()),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.bus.inner.state.lock().closes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(bus: &VirtualBus) -> Box<dyn AdapterHandle> {
        VirtualAdapter::new(bus.clone())
            .open(bus.channel(), Bitrate::Kbps500)
            .unwrap()
    }

    #[test]
    fn test_receive_timeout_is_not_an_error() {
        let bus = VirtualBus::new("vcan0");
        let mut handle = open(&bus);
        let result = handle.receive(Duration::from_millis(5)).unwrap();
        assert_eq!(result, Received::Timeout);
    }

    #[test]
    fn test_frames_and_faults_arrive_in_order() {
        let bus = VirtualBus::manual_clock("vcan0");
        let mut handle = open(&bus);
        bus.send(VendorFrame::new(0x100, false, &[1], DeviceTimestamp::Micros(10)));
        bus.inject_fault(VirtualFault::BusOff);

        match handle.receive(Duration::from_millis(50)).unwrap() {
            Received::Frame(frame) => assert_eq!(frame.id_word, 0x100),
            other => panic!("expected frame, got {:?}", other),
        }
        assert!(matches!(
            handle.receive(Duration::from_millis(50)),
            Err(AdapterError::BusOff { .. })
        ));
    }

    #[test]
    fn test_open_failures() {
        let bus = VirtualBus::new("vcan0");
        let mut adapter = VirtualAdapter::new(bus.clone());

        assert!(matches!(
            adapter.open("vcan1", Bitrate::Kbps500),
            Err(AdapterError::HardwareNotFound { .. })
        ));

        bus.restrict_bitrates(&[Bitrate::Kbps250]);
        assert!(matches!(
            adapter.open("vcan0", Bitrate::Mbps1),
            Err(AdapterError::BitrateUnsupported { bitrate_bps: 1_000_000 })
        ));

        bus.set_present(false);
        assert!(matches!(
            adapter.open("vcan0", Bitrate::Kbps250),
            Err(AdapterError::HardwareNotFound { .. })
        ));
        assert_eq!(bus.open_count(), 0);
    }

    #[test]
    fn test_open_drains_stale_frames() {
        let bus = VirtualBus::new("vcan0");
        bus.transmit(CanId::standard(0x1).unwrap(), &[0xAA]);
        assert_eq!(bus.pending(), 1);

        let mut handle = open(&bus);
        assert_eq!(bus.pending(), 0);
        assert_eq!(
            handle.receive(Duration::from_millis(5)).unwrap(),
            Received::Timeout
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let bus = VirtualBus::new("vcan0");
        let mut handle = open(&bus);
        handle.close();
        handle.close();
        assert_eq!(bus.close_count(), 1);
        assert!(matches!(
            handle.receive(Duration::from_millis(1)),
            Err(AdapterError::Disconnected { .. })
        ));
    }
}
