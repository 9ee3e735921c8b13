use crate::{
    control::{decode_status, RegisterError, StatusBits},
    types::{Switch, Tristate},
};

/// Local mirror of the unit's heat and fan outputs.
///
/// Commands update it optimistically as they write; status notifications from
/// the unit overwrite both fields at once and always win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    heat: Tristate,
    fan: Tristate,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, switch: Switch) -> Tristate {
        match switch {
            Switch::Heat => self.heat,
            Switch::Fan => self.fan,
        }
    }

    pub fn is_primed(&self) -> bool {
        self.heat != Tristate::Unknown && self.fan != Tristate::Unknown
    }

    pub fn record_write(&mut self, switch: Switch, on: bool) {
        let value = Tristate::from_bool(on);
        match switch {
            Switch::Heat => self.heat = value,
            Switch::Fan => self.fan = value,
        }
    }

    /// Decodes a raw status register and replaces both fields. A payload too
    /// short to decode leaves the cache untouched.
    pub fn record_notification(&mut self, raw: &[u8]) -> Result<StatusBits, RegisterError> {
        let bits = decode_status(raw)?;
        self.heat = Tristate::from_bool(bits.heat_on);
        self.fan = Tristate::from_bool(bits.fan_on);
        Ok(bits)
    }
}
