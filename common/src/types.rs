use serde::{Deserialize, Serialize};

use crate::control::ControlPoint;

/// Cached view of a boolean the peripheral owns. `Unknown` until the first
/// read or notification lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tristate {
    #[default]
    Unknown,
    On,
    Off,
}

impl Tristate {
    pub fn from_bool(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Unknown => None,
            Self::On => Some(true),
            Self::Off => Some(false),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }
}

/// The two on/off outputs of the unit. Each is driven through a pair of
/// trigger control points rather than a single writable flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Switch {
    Heat,
    Fan,
}

impl Switch {
    pub fn point(self, on: bool) -> ControlPoint {
        match (self, on) {
            (Self::Heat, true) => ControlPoint::HeatOn,
            (Self::Heat, false) => ControlPoint::HeatOff,
            (Self::Fan, true) => ControlPoint::FanOn,
            (Self::Fan, false) => ControlPoint::FanOff,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heat => "heat",
            Self::Fan => "fan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchAction {
    On,
    Off,
    Toggle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnimationPattern {
    Blinking,
    Breathing,
    Ascending,
    Descending,
}

impl AnimationPattern {
    pub const ALL: [Self; 4] = [
        Self::Blinking,
        Self::Breathing,
        Self::Ascending,
        Self::Descending,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blinking => "Blinking",
            Self::Breathing => "Breathing",
            Self::Ascending => "Ascending",
            Self::Descending => "Descending",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|pattern| pattern.as_str() == name)
    }
}

/// Request for the display animation loop. A `None` pattern is a tag the
/// waveform generator does not know; such a loop exits straight away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnimationRequest {
    pub pattern: Option<AnimationPattern>,
    pub enabled: bool,
}
