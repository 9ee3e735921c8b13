use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use volcano_common::{ControlPoint, RegisterError};

/// Raw payloads pushed by the unit for a subscribed control point.
pub type Notifications = mpsc::UnboundedReceiver<Vec<u8>>;

#[derive(Debug, Error)]
pub enum PeripheralError {
    #[error("peripheral is not connected")]
    NotConnected,
    #[error("no device found at {address}")]
    DeviceNotFound { address: String },
    #[error("device does not expose control point {point}")]
    MissingControlPoint { point: ControlPoint },
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[cfg(feature = "ble")]
    #[error("no bluetooth adapter available")]
    NoAdapter,
    #[cfg(feature = "ble")]
    #[error("bluetooth: {0}")]
    Bluetooth(#[from] btleplug::Error),
}

/// Read/write/subscribe access to the unit's control points.
///
/// Every command, the shutoff timer and the animation loop go through one
/// shared handle; callers keep their own ordering.
#[async_trait]
pub trait Peripheral: Send + Sync {
    async fn connect(&self) -> Result<(), PeripheralError>;

    async fn disconnect(&self) -> Result<(), PeripheralError>;

    async fn write(&self, point: ControlPoint, payload: &[u8]) -> Result<(), PeripheralError>;

    async fn read(&self, point: ControlPoint) -> Result<Vec<u8>, PeripheralError>;

    async fn subscribe(&self, point: ControlPoint) -> Result<Notifications, PeripheralError>;

    async fn unsubscribe(&self, point: ControlPoint) -> Result<(), PeripheralError>;
}
