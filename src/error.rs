//! Error types for the blelink crate.

use thiserror::Error;
use uuid::Uuid;

use crate::permissions::Grant;
use crate::session::SessionState;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// One or more runtime permissions required for radio access were refused.
    #[error("Permission denied, refused grants: {refused:?}")]
    PermissionDenied {
        /// The grants the platform refused.
        refused: Vec<Grant>,
    },

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    RadioUnavailable,

    /// Failed to establish a connection to the device.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Service discovery failed on a connected device.
    #[error("Service discovery failed: {reason}")]
    DiscoveryFailed {
        /// Description of why discovery failed.
        reason: String,
    },

    /// The connection dropped while an operation was in flight.
    #[error("Connection lost")]
    ConnectionLost,

    /// Operation requires a ready session (connected, services discovered).
    #[error("Session not ready: current state is {state}")]
    NotReady {
        /// The state the session was actually in.
        state: SessionState,
    },

    /// No service with this UUID exists in the session's discovery snapshot.
    #[error("Service not found: {uuid}")]
    UnknownService {
        /// The UUID of the service that was not found.
        uuid: Uuid,
    },

    /// No characteristic with this UUID exists under the requested service.
    #[error("Characteristic not found: {uuid}")]
    UnknownCharacteristic {
        /// The UUID of the characteristic that was not found.
        uuid: Uuid,
    },

    /// A payload could not be decoded as UTF-8 text.
    #[error("Invalid UTF-8 payload: {context}")]
    DecodeError {
        /// Description of where the undecodable bytes came from.
        context: String,
    },

    /// Another command for this device is still in flight.
    #[error("Operation already in progress for device {device_id}")]
    OperationInProgress {
        /// The device whose command slot is busy.
        device_id: String,
    },

    /// A live session for this device already exists.
    #[error("Already connected to device {device_id}")]
    AlreadyConnected {
        /// The device with the established session.
        device_id: String,
    },

    /// No discovered device or live session matches this identifier.
    #[error("Device not found: {device_id}")]
    DeviceNotFound {
        /// The identifier that was searched for.
        device_id: String,
    },

    /// Notifications were never started for this characteristic.
    #[error("No active notification subscription for characteristic {characteristic}")]
    NotSubscribed {
        /// The characteristic without a subscription.
        characteristic: Uuid,
    },

    /// Transport-level failure reported by the radio layer.
    #[error("Radio error: {0}")]
    Radio(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
