use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info};

use volcano_common::{
    control::{decode_brightness, StatusBits},
    ControlPoint, RegisterError,
};

use crate::peripheral::{Notifications, Peripheral, PeripheralError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Disconnect,
    Read,
    Write,
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone)]
pub struct PeripheralCall {
    pub at: Instant,
    pub operation: Operation,
    pub point: Option<ControlPoint>,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct SimState {
    connected: bool,
    status: StatusBits,
    target_tenths: u32,
    brightness: u8,
    subscriber: Option<mpsc::UnboundedSender<Vec<u8>>>,
    journal: Vec<PeripheralCall>,
    in_flight: HashMap<ControlPoint, usize>,
    peak_in_flight: HashMap<ControlPoint, usize>,
}

/// In-memory stand-in for the unit, used by host builds without Bluetooth
/// and by the tests. Keeps a journal of every call with its timestamp.
#[derive(Debug)]
pub struct SimulatedPeripheral {
    state: Mutex<SimState>,
    write_latency: Duration,
    echo_status: bool,
}

impl SimulatedPeripheral {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                connected: false,
                status: StatusBits {
                    heat_on: false,
                    fan_on: false,
                },
                target_tenths: 1_850,
                brightness: 70,
                subscriber: None,
                journal: Vec::new(),
                in_flight: HashMap::new(),
                peak_in_flight: HashMap::new(),
            }),
            write_latency: Duration::ZERO,
            echo_status: false,
        }
    }

    /// Push a status notification after every heat/fan change, like the
    /// real unit does.
    pub fn with_status_echo(mut self) -> Self {
        self.echo_status = true;
        self
    }

    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("simulated peripheral mutex poisoned")
    }

    fn record(&self, operation: Operation, point: Option<ControlPoint>, payload: &[u8]) {
        self.lock().journal.push(PeripheralCall {
            at: Instant::now(),
            operation,
            point,
            payload: payload.to_vec(),
        });
    }
}

impl Default for SimulatedPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

impl SimState {
    fn ensure_connected(&self) -> Result<(), PeripheralError> {
        if self.connected {
            Ok(())
        } else {
            Err(PeripheralError::NotConnected)
        }
    }

    fn apply_write(&mut self, point: ControlPoint, payload: &[u8]) -> Result<bool, PeripheralError> {
        let before = self.status;
        match point {
            ControlPoint::HeatOn => self.status.heat_on = true,
            ControlPoint::HeatOff => self.status.heat_on = false,
            ControlPoint::FanOn => self.status.fan_on = true,
            ControlPoint::FanOff => self.status.fan_on = false,
            ControlPoint::Brightness => self.brightness = decode_brightness(payload)?,
            ControlPoint::TargetTemperature => {
                let raw: [u8; 4] =
                    payload
                        .try_into()
                        .map_err(|_| RegisterError::Truncated {
                            point,
                            expected: 4,
                            actual: payload.len(),
                        })?;
                self.target_tenths = u32::from_le_bytes(raw);
            }
            ControlPoint::Status => return Err(PeripheralError::MissingControlPoint { point }),
        }
        Ok(before != self.status)
    }

    fn notify_status(&mut self) {
        let payload = self.status.encode().to_vec();
        if let Some(subscriber) = &self.subscriber {
            if subscriber.send(payload).is_err() {
                self.subscriber = None;
            }
        }
    }
}

#[async_trait]
impl Peripheral for SimulatedPeripheral {
    async fn connect(&self) -> Result<(), PeripheralError> {
        self.record(Operation::Connect, None, &[]);
        self.lock().connected = true;
        info!("simulated peripheral connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PeripheralError> {
        self.record(Operation::Disconnect, None, &[]);
        let mut state = self.lock();
        state.connected = false;
        state.subscriber = None;
        info!("simulated peripheral disconnected");
        Ok(())
    }

    async fn write(&self, point: ControlPoint, payload: &[u8]) -> Result<(), PeripheralError> {
        {
            let mut state = self.lock();
            state.ensure_connected()?;
            state.journal.push(PeripheralCall {
                at: Instant::now(),
                operation: Operation::Write,
                point: Some(point),
                payload: payload.to_vec(),
            });
            let in_flight = state.in_flight.entry(point).or_default();
            *in_flight += 1;
            let current = *in_flight;
            let peak = state.peak_in_flight.entry(point).or_default();
            *peak = (*peak).max(current);
        }
        debug!("simulated write {point} {payload:02x?}");

        if !self.write_latency.is_zero() {
            tokio::time::sleep(self.write_latency).await;
        }

        let mut state = self.lock();
        if let Some(in_flight) = state.in_flight.get_mut(&point) {
            *in_flight = in_flight.saturating_sub(1);
        }
        let status_changed = state.apply_write(point, payload)?;
        if status_changed && self.echo_status {
            state.notify_status();
        }
        Ok(())
    }

    async fn read(&self, point: ControlPoint) -> Result<Vec<u8>, PeripheralError> {
        self.lock().ensure_connected()?;
        self.record(Operation::Read, Some(point), &[]);
        let state = self.lock();
        let raw = match point {
            ControlPoint::Status => state.status.encode().to_vec(),
            ControlPoint::TargetTemperature => state.target_tenths.to_le_bytes().to_vec(),
            ControlPoint::Brightness => u16::from(state.brightness).to_le_bytes().to_vec(),
            _ => return Err(PeripheralError::MissingControlPoint { point }),
        };
        debug!("simulated read {point} -> {raw:02x?}");
        Ok(raw)
    }

    async fn subscribe(&self, point: ControlPoint) -> Result<Notifications, PeripheralError> {
        self.lock().ensure_connected()?;
        if point != ControlPoint::Status {
            return Err(PeripheralError::MissingControlPoint { point });
        }
        self.record(Operation::Subscribe, Some(point), &[]);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().subscriber = Some(sender);
        Ok(receiver)
    }

    async fn unsubscribe(&self, point: ControlPoint) -> Result<(), PeripheralError> {
        self.record(Operation::Unsubscribe, Some(point), &[]);
        self.lock().subscriber = None;
        Ok(())
    }
}

#[cfg(test)]
impl SimulatedPeripheral {
    pub fn calls(&self) -> Vec<PeripheralCall> {
        self.lock().journal.clone()
    }

    pub fn writes(&self) -> Vec<(ControlPoint, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter(|call| call.operation == Operation::Write)
            .filter_map(|call| call.point.map(|point| (point, call.payload)))
            .collect()
    }

    pub fn writes_to(&self, point: ControlPoint) -> Vec<(Instant, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter(|call| call.operation == Operation::Write && call.point == Some(point))
            .map(|call| (call.at, call.payload))
            .collect()
    }

    pub fn peak_concurrent_writes(&self, point: ControlPoint) -> usize {
        self.lock()
            .peak_in_flight
            .get(&point)
            .copied()
            .unwrap_or_default()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    pub fn set_status(&self, status: StatusBits) {
        self.lock().status = status;
    }

    pub fn status(&self) -> StatusBits {
        self.lock().status
    }

    pub fn set_target_tenths(&self, tenths: u32) {
        self.lock().target_tenths = tenths;
    }

    pub fn target_tenths(&self) -> u32 {
        self.lock().target_tenths
    }

    pub fn brightness(&self) -> u8 {
        self.lock().brightness
    }

    /// Pushes a raw status payload to the current subscriber.
    pub fn inject_notification(&self, raw: &[u8]) {
        if let Some(subscriber) = &self.lock().subscriber {
            let _ = subscriber.send(raw.to_vec());
        }
    }

    pub fn status_from_register(raw: &[u8]) -> StatusBits {
        volcano_common::control::decode_status(raw).expect("valid status register")
    }
}
