use thiserror::Error;
use uuid::Uuid;

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no bluetooth adapter found")]
    AdapterNotFound,

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("device {0} is not connected")]
    NotConnected(String),

    #[error("service {0} not found")]
    ServiceNotFound(Uuid),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("subscription to {0} was refused")]
    SubscribeRefused(Uuid),

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("bluetooth: {0}")]
    Ble(#[from] btleplug::Error),
}

/// Reason an authentication attempt ended in the failed state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("key rejected")]
    KeyRejected,

    #[error("challenge response rejected")]
    ChallengeRejected,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("data length {0} is not a multiple of the block size")]
    InvalidLength(usize),
}

#[derive(Error, Debug)]
pub enum BandError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthFailure),

    #[error("configuration: {0}")]
    Configuration(String),

    #[error("device is not connected")]
    NotConnected,

    #[error("device is not authenticated")]
    NotAuthenticated,

    #[error("device session is closed")]
    SessionClosed,
}

pub type Result<T, E = BandError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BandError::from(AuthFailure::KeyRejected);
        assert_eq!(err.to_string(), "authentication failed: key rejected");

        let err = BandError::from(TransportError::CharacteristicNotFound(Uuid::nil()));
        assert_eq!(
            err.to_string(),
            "transport: characteristic 00000000-0000-0000-0000-000000000000 not found"
        );

        let err = BandError::Configuration("bad key".to_string());
        assert_eq!(err.to_string(), "configuration: bad key");
    }
}
