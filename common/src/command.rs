//! Text command grammar.
//!
//! A message is `<tag>` or `<tag>=<payload>`. Tags are matched exactly except
//! for the two families that carry structure inside the tag:
//!
//! * `Animate<Pattern>=<bool>`
//! * `FanOffTimer[HeatOff][ScreenOff][Animate<Pattern>]=<seconds>`, where the
//!   optional flags may appear in any order.
//!
//! Tags outside the vocabulary parse to [`Command::Unrecognized`].

use std::{str::FromStr, time::Duration};

use thiserror::Error;

use crate::types::{AnimationPattern, AnimationRequest, Switch, SwitchAction};

const ANIMATE: &str = "Animate";
const FAN_OFF_TIMER: &str = "FanOffTimer";
const FLAG_HEAT_OFF: &str = "HeatOff";
const FLAG_SCREEN_OFF: &str = "ScreenOff";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Switch {
        switch: Switch,
        action: SwitchAction,
    },
    SetTemperature {
        celsius: u32,
    },
    NextSession,
    SetBrightness {
        percent: u8,
    },
    Animate(AnimationRequest),
    FanOffTimer(ShutoffAction),
    Disconnect,
    Unrecognized,
}

/// Deferred "fan off" with optional follow-ups, run once the delay elapses.
#[derive(Debug, Clone, PartialEq)]
pub struct ShutoffAction {
    pub delay: Duration,
    pub turn_off_heat: bool,
    pub turn_off_screen: bool,
    pub animation: Option<AnimationRequest>,
}

impl ShutoffAction {
    pub fn fan_only(delay: Duration) -> Self {
        Self {
            delay,
            turn_off_heat: false,
            turn_off_screen: false,
            animation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("{tag} needs a value")]
    MissingPayload { tag: String },
    #[error("{tag}: '{value}' is not a whole number")]
    InvalidNumber { tag: String, value: String },
    #[error("{tag}: {value} is out of range")]
    OutOfRange { tag: String, value: String },
    #[error("{tag}: '{value}' is not a boolean")]
    InvalidBool { tag: String, value: String },
    #[error("{tag}: '{value}' is not a delay in seconds")]
    InvalidDelay { tag: String, value: String },
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(message: &str) -> Result<Self, Self::Err> {
        let message = message.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        let (tag, payload) = match message.split_once('=') {
            Some((tag, payload)) => (tag, Some(payload.trim())),
            None => (message, None),
        };

        let command = match (tag, payload) {
            ("HeatOn", None) => switch(Switch::Heat, SwitchAction::On),
            ("HeatOff", None) => switch(Switch::Heat, SwitchAction::Off),
            ("HeatToggle", None) => switch(Switch::Heat, SwitchAction::Toggle),
            ("FanOn", None) => switch(Switch::Fan, SwitchAction::On),
            ("FanOff", None) => switch(Switch::Fan, SwitchAction::Off),
            ("FanToggle", None) => switch(Switch::Fan, SwitchAction::Toggle),
            ("NextSesh", None) => Command::NextSession,
            ("Disconnect", _) => Command::Disconnect,
            ("Temp", payload) => {
                let celsius: u32 = parse_number(tag, payload)?;
                if celsius.checked_mul(10).is_none() {
                    return Err(CommandError::OutOfRange {
                        tag: tag.to_string(),
                        value: celsius.to_string(),
                    });
                }
                Command::SetTemperature { celsius }
            }
            ("SetBrightness", payload) => {
                let percent: u8 = parse_number(tag, payload)?;
                if percent > 100 {
                    return Err(CommandError::OutOfRange {
                        tag: tag.to_string(),
                        value: percent.to_string(),
                    });
                }
                Command::SetBrightness { percent }
            }
            (tag, payload) if tag.starts_with(FAN_OFF_TIMER) => {
                Command::FanOffTimer(parse_fan_off_timer(tag, payload)?)
            }
            (tag, payload) if tag.starts_with(ANIMATE) => {
                let name = &tag[ANIMATE.len()..];
                Command::Animate(AnimationRequest {
                    pattern: AnimationPattern::from_name(name),
                    enabled: parse_bool(tag, payload)?,
                })
            }
            _ => Command::Unrecognized,
        };

        Ok(command)
    }
}

fn switch(switch: Switch, action: SwitchAction) -> Command {
    Command::Switch { switch, action }
}

fn require<'a>(tag: &str, payload: Option<&'a str>) -> Result<&'a str, CommandError> {
    payload
        .filter(|value| !value.is_empty())
        .ok_or_else(|| CommandError::MissingPayload {
            tag: tag.to_string(),
        })
}

fn parse_number<T: FromStr>(tag: &str, payload: Option<&str>) -> Result<T, CommandError> {
    let value = require(tag, payload)?;
    value.parse::<T>().map_err(|_| CommandError::InvalidNumber {
        tag: tag.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(tag: &str, payload: Option<&str>) -> Result<bool, CommandError> {
    let value = require(tag, payload)?;
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        _ => Err(CommandError::InvalidBool {
            tag: tag.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_fan_off_timer(tag: &str, payload: Option<&str>) -> Result<ShutoffAction, CommandError> {
    let value = require(tag, payload)?;
    let delay = value
        .parse::<f64>()
        .ok()
        .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
        .ok_or_else(|| CommandError::InvalidDelay {
            tag: tag.to_string(),
            value: value.to_string(),
        })?;

    let flags = &tag[FAN_OFF_TIMER.len()..];
    let animation = flags.contains(ANIMATE).then(|| AnimationRequest {
        pattern: AnimationPattern::ALL
            .into_iter()
            .find(|pattern| flags.contains(&format!("{ANIMATE}{}", pattern.as_str()))),
        enabled: true,
    });

    Ok(ShutoffAction {
        delay,
        turn_off_heat: flags.contains(FLAG_HEAT_OFF),
        turn_off_screen: flags.contains(FLAG_SCREEN_OFF),
        animation,
    })
}
