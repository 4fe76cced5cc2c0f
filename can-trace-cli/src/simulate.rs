//! Synthetic cyclic traffic for the virtual adapter

use crate::config::SimulatedMessage;
use anyhow::{Context, Result};
use can_trace_core::{CanId, VirtualBus};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct Schedule {
    id: CanId,
    period: Duration,
    data: Vec<u8>,
    counter_byte: Option<usize>,
    next_due: Instant,
}

/// Runs a traffic generator thread until stopped
pub struct Simulator {
    stop_tx: Sender<()>,
    worker: JoinHandle<u64>,
}

impl Simulator {
    /// Start transmitting `messages` onto `bus`, each at its own period
    pub fn start(bus: VirtualBus, messages: &[SimulatedMessage]) -> Result<Self> {
        let now = Instant::now();
        let mut schedule = Vec::with_capacity(messages.len());
        for message in messages {
            let id = CanId::new(message.id, message.extended)
                .with_context(|| format!("Invalid simulated CAN ID 0x{:X}", message.id))?;
            schedule.push(Schedule {
                id,
                period: Duration::from_millis(message.period_ms.max(1)),
                data: message.data.clone(),
                counter_byte: message.counter_byte,
                next_due: now,
            });
        }
        log::info!("Simulating {} cyclic messages on {}", schedule.len(), bus.channel());

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let worker = thread::Builder::new()
            .name("can-simulator".to_string())
            .spawn(move || {
                let mut sent = 0u64;
                loop {
                    let Some(next) = schedule.iter().map(|s| s.next_due).min() else {
                        break;
                    };
                    let wait = next.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }

                    let now = Instant::now();
                    for entry in schedule.iter_mut().filter(|s| s.next_due <= now) {
                        bus.transmit(entry.id, &entry.data);
                        sent += 1;
                        if let Some(byte) = entry.counter_byte.and_then(|i| entry.data.get_mut(i)) {
                            *byte = byte.wrapping_add(1);
                        }
                        entry.next_due += entry.period;
                    }
                }
                sent
            })
            .context("Failed to spawn simulator thread")?;

        Ok(Self { stop_tx, worker })
    }

    /// Stop the generator and return how many frames it sent
    pub fn stop(self) -> u64 {
        let _ = self.stop_tx.send(());
        match self.worker.join() {
            Ok(sent) => {
                log::debug!("Simulator sent {} frames", sent);
                sent
            }
            Err(_) => {
                log::warn!("Simulator thread panicked");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulator_emits_frames() {
        let bus = VirtualBus::new("vcan0");
        let messages = vec![SimulatedMessage::new(0x100, 5, vec![0]).with_counter(0)];

        let simulator = Simulator::start(bus.clone(), &messages).unwrap();
        thread::sleep(Duration::from_millis(60));
        let sent = simulator.stop();

        assert!(sent >= 2);
        assert_eq!(bus.pending() as u64, sent);
    }

    #[test]
    fn test_rejects_out_of_range_id() {
        let bus = VirtualBus::new("vcan0");
        let messages = vec![SimulatedMessage::new(0x800, 10, vec![])];
        assert!(Simulator::start(bus, &messages).is_err());
    }
}
