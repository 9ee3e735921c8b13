use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::framing::Framing;

pub const MIN_TARGET_TEMP_C: u32 = 40;
pub const MAX_TARGET_TEMP_C: u32 = 230;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub device_address: String,
    pub initial_temp_c: Option<u32>,
    pub fan_on_at_connect: bool,
    /// With `fan_on_at_connect`, run the fan only this long. Zero leaves it on.
    pub fan_on_seconds: f64,
    /// Safety shutoff for the whole process. `None` runs until told otherwise.
    pub max_lifetime_secs: Option<u64>,
    pub framing: Framing,
    pub discovery_scan_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 65432,
            device_address: "XX:XX:XX:XX:XX:XX".to_string(),
            initial_temp_c: None,
            fan_on_at_connect: false,
            fan_on_seconds: 0.0,
            max_lifetime_secs: Some(18_000),
            framing: Framing::Datagram,
            discovery_scan_secs: 5,
        }
    }
}

impl BridgeConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    pub fn sanitize(&mut self) {
        self.initial_temp_c = self
            .initial_temp_c
            .map(|temp| temp.clamp(MIN_TARGET_TEMP_C, MAX_TARGET_TEMP_C));

        if !self.fan_on_seconds.is_finite() || self.fan_on_seconds < 0.0 {
            self.fan_on_seconds = 0.0;
        }

        if self.max_lifetime_secs == Some(0) {
            self.max_lifetime_secs = None;
        }

        self.discovery_scan_secs = self.discovery_scan_secs.clamp(1, 60);
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_secs.map(Duration::from_secs)
    }

    /// Delay for the startup fan timer, if one should run.
    pub fn startup_fan_timer(&self) -> Option<Duration> {
        if self.fan_on_at_connect && self.fan_on_seconds > 0.0 {
            Duration::try_from_secs_f64(self.fan_on_seconds).ok()
        } else {
            None
        }
    }
}
