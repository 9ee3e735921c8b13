pub mod command;
pub mod config;
pub mod control;
pub mod framing;
pub mod state;
pub mod types;
pub mod waveform;

pub use command::{Command, CommandError, ShutoffAction};
pub use config::BridgeConfig;
pub use control::{ControlPoint, RegisterError, StatusBits};
pub use framing::{Framing, LineFramer};
pub use state::DeviceState;
pub use types::{AnimationPattern, AnimationRequest, Switch, SwitchAction, Tristate};
pub use waveform::{Waveform, RESTING_BRIGHTNESS};
