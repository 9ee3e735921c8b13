//! Command router and the state it drives.
//!
//! `Bridge` is owned by the session loop and only ever touched from it, so the
//! device cache needs no lock. Every handler finishes its cache update before
//! the caller writes the reply.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use volcano_common::{
    control::{
        decode_target_temp, encode_brightness, encode_target_temp, next_session_temp, TRIGGER,
    },
    AnimationRequest, BridgeConfig, Command, ControlPoint, DeviceState, ShutoffAction, Switch,
    SwitchAction, Tristate,
};

use crate::{
    animation::{AnimationEngine, AnimationState},
    peripheral::{Peripheral, PeripheralError},
    shutoff::{ShutoffDue, ShutoffScheduler},
};

/// What the session should do after a message was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send these bytes back to the client.
    Reply(Vec<u8>),
    /// Stop serving; nothing is sent back.
    Disconnect,
}

pub struct Bridge {
    peripheral: Arc<dyn Peripheral>,
    state: DeviceState,
    shutoff: ShutoffScheduler,
    animation: AnimationEngine,
}

impl Bridge {
    pub fn new(peripheral: Arc<dyn Peripheral>) -> (Self, mpsc::UnboundedReceiver<ShutoffDue>) {
        let (shutoff, due_rx) = ShutoffScheduler::new();
        let bridge = Self {
            animation: AnimationEngine::new(Arc::clone(&peripheral)),
            peripheral,
            state: DeviceState::new(),
            shutoff,
        };
        (bridge, due_rx)
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    #[cfg(test)]
    pub fn animation_state(&self) -> AnimationState {
        self.animation.state()
    }

    #[cfg(test)]
    pub fn shutoff_pending(&self) -> bool {
        self.shutoff.is_pending()
    }

    /// Reads the status register once so toggles have something to flip.
    pub async fn prime(&mut self) -> Result<(), PeripheralError> {
        let raw = self.peripheral.read(ControlPoint::Status).await?;
        let bits = self.state.record_notification(&raw)?;
        info!(
            "initial status: heat {}, fan {}",
            on_off(bits.heat_on),
            on_off(bits.fan_on)
        );
        Ok(())
    }

    /// Applies the configured fan and target temperature after connecting.
    pub async fn startup(&mut self, config: &BridgeConfig) -> Result<(), PeripheralError> {
        if config.fan_on_at_connect {
            match config.startup_fan_timer() {
                Some(delay) => self.fan_off_timer(ShutoffAction::fan_only(delay)).await?,
                None => self.set_switch(Switch::Fan, true).await?,
            }
        }

        if let Some(celsius) = config.initial_temp_c {
            info!("setting initial target temperature {celsius}°C");
            self.write_target_temperature(celsius).await?;
        }
        Ok(())
    }

    /// Routes one inbound message. Malformed and unknown messages are echoed
    /// without touching the peripheral.
    pub async fn handle_message(&mut self, message: &[u8]) -> Result<Outcome, PeripheralError> {
        let echo = Outcome::Reply(message.to_vec());
        let Ok(text) = std::str::from_utf8(message) else {
            warn!("ignoring non-UTF-8 message ({} bytes)", message.len());
            return Ok(echo);
        };

        info!("received {:?}", text.trim_end());
        let command = match text.parse::<Command>() {
            Ok(command) => command,
            Err(err) => {
                warn!("ignoring malformed command: {err}");
                return Ok(echo);
            }
        };

        if self.dispatch(command).await? {
            Ok(Outcome::Disconnect)
        } else {
            Ok(echo)
        }
    }

    /// Returns `true` when the session should end.
    async fn dispatch(&mut self, command: Command) -> Result<bool, PeripheralError> {
        match command {
            Command::Switch { switch, action } => match action {
                SwitchAction::On => self.set_switch(switch, true).await?,
                SwitchAction::Off => self.set_switch(switch, false).await?,
                SwitchAction::Toggle => self.toggle(switch).await?,
            },
            Command::SetTemperature { celsius } => {
                self.write_target_temperature(celsius).await?;
                self.set_switch(Switch::Heat, true).await?;
            }
            Command::NextSession => self.next_session().await?,
            Command::SetBrightness { percent } => self.set_brightness(percent).await?,
            Command::Animate(request) => self.animate(request).await,
            Command::FanOffTimer(action) => self.fan_off_timer(action).await?,
            Command::Disconnect => {
                self.shutdown().await?;
                return Ok(true);
            }
            Command::Unrecognized => debug!("unrecognized command, echoing"),
        }
        Ok(false)
    }

    async fn set_switch(&mut self, switch: Switch, on: bool) -> Result<(), PeripheralError> {
        self.peripheral.write(switch.point(on), &TRIGGER).await?;
        self.state.record_write(switch, on);
        debug!("{} {}", switch.as_str(), on_off(on));
        Ok(())
    }

    async fn toggle(&mut self, switch: Switch) -> Result<(), PeripheralError> {
        let current = match self.state.read(switch) {
            Tristate::Unknown => {
                self.prime().await?;
                self.state.read(switch)
            }
            known => known,
        };
        let on = !current.as_bool().unwrap_or(false);
        self.set_switch(switch, on).await
    }

    async fn write_target_temperature(&mut self, celsius: u32) -> Result<(), PeripheralError> {
        let raw = encode_target_temp(celsius)?;
        self.peripheral
            .write(ControlPoint::TargetTemperature, &raw)
            .await
    }

    // Read then write, not atomic against other writers of the register.
    async fn next_session(&mut self) -> Result<(), PeripheralError> {
        let raw = self.peripheral.read(ControlPoint::TargetTemperature).await?;
        let current = decode_target_temp(&raw)?;
        let next = next_session_temp(current);
        info!("next session: {current}°C -> {next}°C");
        self.write_target_temperature(next).await?;
        self.set_switch(Switch::Heat, true).await
    }

    async fn set_brightness(&mut self, percent: u8) -> Result<(), PeripheralError> {
        let raw = encode_brightness(percent)?;
        self.peripheral.write(ControlPoint::Brightness, &raw).await
    }

    async fn animate(&mut self, request: AnimationRequest) {
        if request.enabled {
            self.animation.start(request).await;
        } else {
            self.animation.stop().await;
        }
    }

    async fn fan_off_timer(&mut self, action: ShutoffAction) -> Result<(), PeripheralError> {
        self.set_switch(Switch::Fan, true).await?;
        self.shutoff.schedule(action);
        Ok(())
    }

    /// Runs a fired shutoff, unless it was superseded in the meantime.
    pub async fn on_shutoff_due(&mut self, due: ShutoffDue) -> Result<(), PeripheralError> {
        let Some(action) = self.shutoff.take_due(due) else {
            return Ok(());
        };

        info!("fan shutoff firing");
        self.set_switch(Switch::Fan, false).await?;
        if action.turn_off_heat {
            self.set_switch(Switch::Heat, false).await?;
        }
        if action.turn_off_screen {
            self.set_brightness(0).await?;
        }
        if let Some(request) = action.animation {
            self.animate(request).await;
        }
        Ok(())
    }

    /// Status pushed by the unit. Overrides whatever the cache holds.
    pub fn apply_notification(&mut self, raw: &[u8]) {
        match self.state.record_notification(raw) {
            Ok(bits) => debug!(
                "status notification: heat {}, fan {}",
                on_off(bits.heat_on),
                on_off(bits.fan_on)
            ),
            Err(err) => warn!("ignoring status notification: {err}"),
        }
    }

    /// Stops background work so nothing writes after this returns.
    pub async fn quiesce(&mut self) {
        if self.shutoff.cancel() {
            info!("cancelled pending fan shutoff");
        }
        if let AnimationState::Running(_) = self.animation.state() {
            info!("stopping animation");
        }
        self.animation.stop().await;
    }

    /// Stops background work, then turns heat and fan off.
    pub async fn shutdown(&mut self) -> Result<(), PeripheralError> {
        self.quiesce().await;
        self.set_switch(Switch::Heat, false).await?;
        self.set_switch(Switch::Fan, false).await
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;
    use volcano_common::{StatusBits, RESTING_BRIGHTNESS};

    use super::*;
    use crate::simulated::{Operation, SimulatedPeripheral};

    type Harness = (
        Bridge,
        mpsc::UnboundedReceiver<ShutoffDue>,
        Arc<SimulatedPeripheral>,
    );

    async fn primed(status: StatusBits) -> Harness {
        let peripheral = Arc::new(SimulatedPeripheral::new());
        peripheral.set_status(status);
        peripheral.connect().await.unwrap();
        let (mut bridge, due_rx) = Bridge::new(peripheral.clone());
        bridge.prime().await.unwrap();
        peripheral.clear_journal();
        (bridge, due_rx, peripheral)
    }

    fn idle() -> StatusBits {
        StatusBits {
            heat_on: false,
            fan_on: false,
        }
    }

    fn assert_near(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual <= expected + Duration::from_millis(5),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    async fn send(bridge: &mut Bridge, message: &str) -> Outcome {
        bridge.handle_message(message.as_bytes()).await.unwrap()
    }

    #[tokio::test]
    async fn unknown_message_is_echoed_without_calls() {
        let (mut bridge, _due_rx, peripheral) = primed(idle()).await;

        let outcome = send(&mut bridge, "Ping").await;

        assert_eq!(outcome, Outcome::Reply(b"Ping".to_vec()));
        assert!(peripheral.calls().is_empty());
    }

    #[tokio::test]
    async fn malformed_payloads_are_echoed_without_calls() {
        let (mut bridge, _due_rx, peripheral) = primed(idle()).await;

        for message in ["Temp=hot", "SetBrightness=150", "FanOffTimer=soon", "AnimateBlinking=maybe"] {
            assert_eq!(
                send(&mut bridge, message).await,
                Outcome::Reply(message.as_bytes().to_vec())
            );
        }
        let outcome = bridge.handle_message(&[0xff, 0xfe]).await.unwrap();

        assert_eq!(outcome, Outcome::Reply(vec![0xff, 0xfe]));
        assert!(peripheral.calls().is_empty());
    }

    #[tokio::test]
    async fn heat_and_fan_commands_write_and_cache() {
        let (mut bridge, _due_rx, peripheral) = primed(idle()).await;

        send(&mut bridge, "HeatOn").await;
        send(&mut bridge, "FanOn").await;
        send(&mut bridge, "HeatOff").await;

        assert_eq!(
            peripheral.writes(),
            vec![
                (ControlPoint::HeatOn, vec![0]),
                (ControlPoint::FanOn, vec![0]),
                (ControlPoint::HeatOff, vec![0]),
            ]
        );
        assert_eq!(bridge.state().read(Switch::Heat), Tristate::Off);
        assert_eq!(bridge.state().read(Switch::Fan), Tristate::On);
    }

    #[tokio::test]
    async fn double_toggle_restores_state() {
        let (mut bridge, _due_rx, peripheral) = primed(StatusBits {
            heat_on: true,
            fan_on: false,
        })
        .await;

        send(&mut bridge, "HeatToggle").await;
        send(&mut bridge, "FanToggle").await;
        assert_eq!(bridge.state().read(Switch::Heat), Tristate::Off);
        assert_eq!(bridge.state().read(Switch::Fan), Tristate::On);

        send(&mut bridge, "HeatToggle").await;
        send(&mut bridge, "FanToggle").await;

        assert_eq!(bridge.state().read(Switch::Heat), Tristate::On);
        assert_eq!(bridge.state().read(Switch::Fan), Tristate::Off);
        assert_eq!(
            peripheral.status(),
            StatusBits {
                heat_on: true,
                fan_on: false
            }
        );
    }

    #[tokio::test]
    async fn toggle_reads_status_when_cache_unknown() {
        let peripheral = Arc::new(SimulatedPeripheral::new());
        peripheral.set_status(StatusBits {
            heat_on: false,
            fan_on: true,
        });
        peripheral.connect().await.unwrap();
        let (mut bridge, _due_rx) = Bridge::new(peripheral.clone());

        send(&mut bridge, "FanToggle").await;

        let calls = peripheral.calls();
        assert_eq!(calls[1].operation, Operation::Read);
        assert_eq!(calls[1].point, Some(ControlPoint::Status));
        assert_eq!(peripheral.writes(), vec![(ControlPoint::FanOff, vec![0])]);
        assert_eq!(bridge.state().read(Switch::Fan), Tristate::Off);
    }

    #[tokio::test]
    async fn temp_writes_tenths_then_heats() {
        let (mut bridge, _due_rx, peripheral) = primed(idle()).await;

        send(&mut bridge, "Temp=190").await;

        assert_eq!(
            peripheral.writes(),
            vec![
                (ControlPoint::TargetTemperature, 1_900u32.to_le_bytes().to_vec()),
                (ControlPoint::HeatOn, vec![0]),
            ]
        );
        assert_eq!(peripheral.target_tenths(), 1_900);
        assert_eq!(bridge.state().read(Switch::Heat), Tristate::On);
    }

    #[tokio::test]
    async fn next_session_cycles_presets() {
        let (mut bridge, _due_rx, peripheral) = primed(idle()).await;
        peripheral.set_target_tenths(1_850);

        let mut seen = Vec::new();
        for _ in 0..5 {
            send(&mut bridge, "NextSesh").await;
            seen.push(peripheral.target_tenths() / 10);
        }

        assert_eq!(seen, vec![190, 195, 200, 185, 190]);
        assert_eq!(bridge.state().read(Switch::Heat), Tristate::On);
    }

    #[tokio::test]
    async fn next_session_resets_off_preset_values() {
        let (mut bridge, _due_rx, peripheral) = primed(idle()).await;
        peripheral.set_target_tenths(2_100);

        send(&mut bridge, "NextSesh").await;

        assert_eq!(peripheral.target_tenths(), 1_850);
    }

    #[tokio::test]
    async fn set_brightness_writes_register() {
        let (mut bridge, _due_rx, peripheral) = primed(idle()).await;

        send(&mut bridge, "SetBrightness=42").await;

        assert_eq!(peripheral.writes(), vec![(ControlPoint::Brightness, vec![42, 0])]);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduled_fan_timer_fires_once() {
        let (mut bridge, mut due_rx, peripheral) = primed(idle()).await;
        let start = Instant::now();

        send(&mut bridge, "FanOffTimer=5").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        send(&mut bridge, "FanOffTimer=10").await;
        assert_eq!(bridge.state().read(Switch::Fan), Tristate::On);

        let due = due_rx.recv().await.unwrap();
        bridge.on_shutoff_due(due).await.unwrap();

        let fan_off = peripheral.writes_to(ControlPoint::FanOff);
        assert_eq!(fan_off.len(), 1);
        assert_near(fan_off[0].0 - start, Duration::from_secs(12));
        assert_eq!(bridge.state().read(Switch::Fan), Tristate::Off);
        assert!(!bridge.shutoff_pending());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(due_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fired_timer_runs_flags_in_order() {
        let (mut bridge, mut due_rx, peripheral) = primed(idle()).await;

        send(&mut bridge, "FanOffTimerScreenOffHeatOff=3").await;
        let due = due_rx.recv().await.unwrap();
        bridge.on_shutoff_due(due).await.unwrap();

        assert_eq!(
            peripheral.writes(),
            vec![
                (ControlPoint::FanOn, vec![0]),
                (ControlPoint::FanOff, vec![0]),
                (ControlPoint::HeatOff, vec![0]),
                (ControlPoint::Brightness, vec![0, 0]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fired_timer_starts_chained_animation() {
        let (mut bridge, mut due_rx, peripheral) = primed(idle()).await;

        send(&mut bridge, "FanOffTimerAnimateBlinking=1").await;
        let due = due_rx.recv().await.unwrap();
        bridge.on_shutoff_due(due).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            bridge.animation_state(),
            AnimationState::Running(Some(volcano_common::AnimationPattern::Blinking))
        );
        bridge.quiesce().await;
        let brightness = peripheral.writes_to(ControlPoint::Brightness);
        assert_eq!(brightness.first().map(|(_, raw)| raw[0]), Some(100));
        assert_eq!(brightness.last().map(|(_, raw)| raw[0]), Some(RESTING_BRIGHTNESS));
    }

    #[tokio::test(start_paused = true)]
    async fn animate_false_stops_with_resting_brightness() {
        let (mut bridge, _due_rx, peripheral) = primed(idle()).await;

        send(&mut bridge, "AnimateBreathing=True").await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        send(&mut bridge, "AnimateBreathing=False").await;

        assert_eq!(bridge.animation_state(), AnimationState::Stopped);
        let brightness = peripheral.writes_to(ControlPoint::Brightness);
        assert_eq!(brightness.last().map(|(_, raw)| raw[0]), Some(RESTING_BRIGHTNESS));
    }

    #[tokio::test]
    async fn notification_overrides_cache() {
        let (mut bridge, _due_rx, _peripheral) = primed(idle()).await;
        send(&mut bridge, "FanOn").await;

        bridge.apply_notification(&[0x20, 0x00]);

        assert_eq!(bridge.state().read(Switch::Heat), Tristate::On);
        assert_eq!(bridge.state().read(Switch::Fan), Tristate::Off);

        bridge.apply_notification(&[0x20]);
        assert_eq!(bridge.state().read(Switch::Heat), Tristate::On);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_turns_everything_off_without_reply() {
        let (mut bridge, mut due_rx, peripheral) = primed(idle()).await;
        send(&mut bridge, "FanOffTimer=5").await;
        send(&mut bridge, "HeatOn").await;
        peripheral.clear_journal();

        let outcome = send(&mut bridge, "Disconnect").await;

        assert_eq!(outcome, Outcome::Disconnect);
        assert_eq!(
            peripheral.writes(),
            vec![(ControlPoint::HeatOff, vec![0]), (ControlPoint::FanOff, vec![0])]
        );
        assert!(!bridge.shutoff_pending());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(due_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn startup_applies_config() {
        let peripheral = Arc::new(SimulatedPeripheral::new());
        peripheral.connect().await.unwrap();
        let (mut bridge, _due_rx) = Bridge::new(peripheral.clone());
        let config = BridgeConfig {
            fan_on_at_connect: true,
            initial_temp_c: Some(195),
            ..BridgeConfig::default()
        };

        bridge.startup(&config).await.unwrap();

        assert_eq!(
            peripheral.writes(),
            vec![
                (ControlPoint::FanOn, vec![0]),
                (ControlPoint::TargetTemperature, 1_950u32.to_le_bytes().to_vec()),
            ]
        );
        assert!(!bridge.shutoff_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_fan_timer_schedules_shutoff() {
        let peripheral = Arc::new(SimulatedPeripheral::new());
        peripheral.connect().await.unwrap();
        let (mut bridge, mut due_rx) = Bridge::new(peripheral.clone());
        let config = BridgeConfig {
            fan_on_at_connect: true,
            fan_on_seconds: 2.5,
            ..BridgeConfig::default()
        };
        let start = Instant::now();

        bridge.startup(&config).await.unwrap();
        let due = due_rx.recv().await.unwrap();
        bridge.on_shutoff_due(due).await.unwrap();

        let fan_off = peripheral.writes_to(ControlPoint::FanOff);
        assert_eq!(fan_off.len(), 1);
        assert_near(fan_off[0].0 - start, Duration::from_millis(2_500));
    }

    #[tokio::test]
    async fn peripheral_failure_propagates() {
        let peripheral = Arc::new(SimulatedPeripheral::new());
        let (mut bridge, _due_rx) = Bridge::new(peripheral);

        let result = bridge.handle_message(b"HeatOn").await;

        assert!(matches!(result, Err(PeripheralError::NotConnected)));
    }
}
