//! Control points exposed by the unit and the byte layouts of the registers
//! behind them.

use thiserror::Error;

const UUID_SUFFIX: &str = "-5354-4f52-5a26-4249434b454c";

/// Single byte written to the on/off trigger points.
pub const TRIGGER: [u8; 1] = [0];

pub const STATUS_HEAT_BIT: u16 = 0x0020;
pub const STATUS_FAN_BIT: u16 = 0x2000;

/// Target temperatures the session shortcut steps through, in °C.
pub const SESSION_TEMPS_C: [u32; 4] = [185, 190, 195, 200];
pub const SESSION_STEP_C: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControlPoint {
    HeatOn,
    HeatOff,
    FanOn,
    FanOff,
    Brightness,
    TargetTemperature,
    Status,
}

impl ControlPoint {
    pub const ALL: [Self; 7] = [
        Self::HeatOn,
        Self::HeatOff,
        Self::FanOn,
        Self::FanOff,
        Self::Brightness,
        Self::TargetTemperature,
        Self::Status,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeatOn => "heat-on",
            Self::HeatOff => "heat-off",
            Self::FanOn => "fan-on",
            Self::FanOff => "fan-off",
            Self::Brightness => "brightness",
            Self::TargetTemperature => "target-temperature",
            Self::Status => "status-register",
        }
    }

    fn uuid_prefix(self) -> &'static str {
        match self {
            Self::HeatOn => "1011000f",
            Self::HeatOff => "10110010",
            Self::FanOn => "10110013",
            Self::FanOff => "10110014",
            Self::Brightness => "10110005",
            Self::TargetTemperature => "10110003",
            Self::Status => "1010000c",
        }
    }

    /// GATT characteristic UUID, lowercase hyphenated.
    pub fn uuid(self) -> String {
        format!("{}{}", self.uuid_prefix(), UUID_SUFFIX)
    }

    pub fn from_uuid(uuid: &str) -> Option<Self> {
        let uuid = uuid.to_ascii_lowercase();
        Self::ALL.into_iter().find(|point| point.uuid() == uuid)
    }
}

impl std::fmt::Display for ControlPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("{point} register needs {expected} bytes, got {actual}")]
    Truncated {
        point: ControlPoint,
        expected: usize,
        actual: usize,
    },
    #[error("{celsius} °C does not fit the target temperature register")]
    TemperatureOverflow { celsius: u32 },
    #[error("brightness {percent}% is above 100")]
    BrightnessRange { percent: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusBits {
    pub heat_on: bool,
    pub fan_on: bool,
}

impl StatusBits {
    pub fn encode(self) -> [u8; 2] {
        let mut raw = 0u16;
        if self.heat_on {
            raw |= STATUS_HEAT_BIT;
        }
        if self.fan_on {
            raw |= STATUS_FAN_BIT;
        }
        raw.to_le_bytes()
    }
}

fn le_u16(point: ControlPoint, raw: &[u8]) -> Result<u16, RegisterError> {
    match raw {
        [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
        _ => Err(RegisterError::Truncated {
            point,
            expected: 2,
            actual: raw.len(),
        }),
    }
}

pub fn decode_status(raw: &[u8]) -> Result<StatusBits, RegisterError> {
    let value = le_u16(ControlPoint::Status, raw)?;
    Ok(StatusBits {
        heat_on: value & STATUS_HEAT_BIT != 0,
        fan_on: value & STATUS_FAN_BIT != 0,
    })
}

/// Target temperature travels in tenths of a degree, 4 bytes little-endian.
pub fn encode_target_temp(celsius: u32) -> Result<[u8; 4], RegisterError> {
    celsius
        .checked_mul(10)
        .map(u32::to_le_bytes)
        .ok_or(RegisterError::TemperatureOverflow { celsius })
}

/// Reads the low 16 bits of the register and rounds tenths to whole degrees.
pub fn decode_target_temp(raw: &[u8]) -> Result<u32, RegisterError> {
    let tenths = u32::from(le_u16(ControlPoint::TargetTemperature, raw)?);
    Ok((tenths + 5) / 10)
}

pub fn encode_brightness(percent: u8) -> Result<[u8; 2], RegisterError> {
    if percent > 100 {
        return Err(RegisterError::BrightnessRange { percent });
    }
    Ok(u16::from(percent).to_le_bytes())
}

pub fn decode_brightness(raw: &[u8]) -> Result<u8, RegisterError> {
    let value = le_u16(ControlPoint::Brightness, raw)?;
    Ok(value.min(100) as u8)
}

pub fn next_session_temp(current_c: u32) -> u32 {
    let next = current_c + SESSION_STEP_C;
    if SESSION_TEMPS_C.contains(&next) {
        next
    } else {
        SESSION_TEMPS_C[0]
    }
}
