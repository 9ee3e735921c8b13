//! Display animation loop.
//!
//! One loop runs at a time. Stopping is cooperative: the loop polls a run
//! flag between writes, and [`AnimationEngine::stop`] waits for the task to
//! finish, resting write included, before returning. Two loops never write
//! the brightness register at the same time.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use volcano_common::{
    control::encode_brightness, AnimationPattern, AnimationRequest, ControlPoint, Waveform,
    RESTING_BRIGHTNESS,
};

use crate::peripheral::{Peripheral, PeripheralError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimationState {
    Stopped,
    Running(Option<AnimationPattern>),
}

struct RunningLoop {
    pattern: Option<AnimationPattern>,
    keep_running: Arc<AtomicBool>,
    task: JoinHandle<Result<(), PeripheralError>>,
}

pub struct AnimationEngine {
    peripheral: Arc<dyn Peripheral>,
    running: Option<RunningLoop>,
}

impl AnimationEngine {
    pub fn new(peripheral: Arc<dyn Peripheral>) -> Self {
        Self {
            peripheral,
            running: None,
        }
    }

    pub fn state(&self) -> AnimationState {
        match &self.running {
            Some(running) if !running.task.is_finished() => {
                AnimationState::Running(running.pattern)
            }
            _ => AnimationState::Stopped,
        }
    }

    /// Stops the current loop, waits for it, then starts `request` if it is
    /// enabled.
    pub async fn start(&mut self, request: AnimationRequest) {
        self.stop().await;
        if !request.enabled {
            return;
        }

        let keep_running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run_loop(
            Arc::clone(&self.peripheral),
            request.pattern,
            Arc::clone(&keep_running),
        ));
        info!("animation {} started", pattern_name(request.pattern));
        self.running = Some(RunningLoop {
            pattern: request.pattern,
            keep_running,
            task,
        });
    }

    /// Clears the run flag and waits until the loop has written its resting
    /// brightness and exited. Loop failures are logged, not returned.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.keep_running.store(false, Ordering::Release);
        debug!("animation {} stopping", pattern_name(running.pattern));
        match running.task.await {
            Ok(Ok(())) => info!("animation {} stopped", pattern_name(running.pattern)),
            Ok(Err(err)) => warn!(
                "animation {} ended with peripheral error: {err}",
                pattern_name(running.pattern)
            ),
            Err(err) => warn!("animation task failed: {err}"),
        }
    }
}

impl Drop for AnimationEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.keep_running.store(false, Ordering::Release);
            running.task.abort();
        }
    }
}

fn pattern_name(pattern: Option<AnimationPattern>) -> &'static str {
    pattern.map_or("<unknown>", AnimationPattern::as_str)
}

async fn run_loop(
    peripheral: Arc<dyn Peripheral>,
    pattern: Option<AnimationPattern>,
    keep_running: Arc<AtomicBool>,
) -> Result<(), PeripheralError> {
    if let Some(pattern) = pattern {
        let mut wave = Waveform::new(pattern);
        while keep_running.load(Ordering::Acquire) {
            let brightness = wave.next_brightness();
            peripheral
                .write(ControlPoint::Brightness, &encode_brightness(brightness)?)
                .await?;
            tokio::time::sleep(wave.interval()).await;
        }
    }

    peripheral
        .write(
            ControlPoint::Brightness,
            &encode_brightness(RESTING_BRIGHTNESS)?,
        )
        .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::simulated::SimulatedPeripheral;

    async fn connected(latency: Duration) -> Arc<SimulatedPeripheral> {
        let peripheral = Arc::new(SimulatedPeripheral::new().with_write_latency(latency));
        peripheral.connect().await.unwrap();
        peripheral
    }

    fn brightness_values(peripheral: &SimulatedPeripheral) -> Vec<u8> {
        peripheral
            .writes_to(ControlPoint::Brightness)
            .into_iter()
            .map(|(_, payload)| payload[0])
            .collect()
    }

    fn request(pattern: AnimationPattern, enabled: bool) -> AnimationRequest {
        AnimationRequest {
            pattern: Some(pattern),
            enabled,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_with_resting_brightness() {
        let peripheral = connected(Duration::ZERO).await;
        let mut engine = AnimationEngine::new(peripheral.clone());

        engine.start(request(AnimationPattern::Breathing, true)).await;
        assert_eq!(
            engine.state(),
            AnimationState::Running(Some(AnimationPattern::Breathing))
        );
        tokio::time::sleep(Duration::from_millis(350)).await;
        engine.stop().await;

        let values = brightness_values(&peripheral);
        assert_eq!(&values[..4], &[8, 16, 24, 32]);
        assert_eq!(values.last(), Some(&RESTING_BRIGHTNESS));
        assert_eq!(engine.state(), AnimationState::Stopped);
        assert_eq!(peripheral.brightness(), RESTING_BRIGHTNESS);
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_waits_for_previous_loop() {
        let peripheral = connected(Duration::from_millis(30)).await;
        let mut engine = AnimationEngine::new(peripheral.clone());

        engine.start(request(AnimationPattern::Breathing, true)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        engine.start(request(AnimationPattern::Blinking, true)).await;
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        engine.stop().await;

        assert_eq!(peripheral.peak_concurrent_writes(ControlPoint::Brightness), 1);

        let values = brightness_values(&peripheral);
        let handover = values
            .iter()
            .position(|value| *value == RESTING_BRIGHTNESS)
            .unwrap();
        assert!(values[..handover].iter().all(|value| value % 8 == 0 || *value == 100));
        assert_eq!(&values[handover + 1..handover + 3], &[100, 0]);
        assert_eq!(values.last(), Some(&RESTING_BRIGHTNESS));

        let writes = peripheral.writes_to(ControlPoint::Brightness);
        assert!(writes.windows(2).all(|pair| pair[1].0 - pair[0].0 >= Duration::from_millis(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_request_only_stops() {
        let peripheral = connected(Duration::ZERO).await;
        let mut engine = AnimationEngine::new(peripheral.clone());

        engine.start(request(AnimationPattern::Ascending, true)).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        engine.start(request(AnimationPattern::Ascending, false)).await;
        let count = peripheral.writes_to(ControlPoint::Brightness).len();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(engine.state(), AnimationState::Stopped);
        assert_eq!(peripheral.writes_to(ControlPoint::Brightness).len(), count);
        assert_eq!(brightness_values(&peripheral).last(), Some(&RESTING_BRIGHTNESS));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_pattern_exits_immediately() {
        let peripheral = connected(Duration::ZERO).await;
        let mut engine = AnimationEngine::new(peripheral.clone());

        engine
            .start(AnimationRequest {
                pattern: None,
                enabled: true,
            })
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(engine.state(), AnimationState::Stopped);
        assert_eq!(brightness_values(&peripheral), vec![RESTING_BRIGHTNESS]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_loop_writes_nothing() {
        let peripheral = connected(Duration::ZERO).await;
        let mut engine = AnimationEngine::new(peripheral.clone());

        engine.stop().await;

        assert!(peripheral.writes_to(ControlPoint::Brightness).is_empty());
    }
}
