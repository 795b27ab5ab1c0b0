use thiserror::Error;

/// Failure talking to the plug over HTTP.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeviceError {
    /// Connection refused, DNS failure or request timeout.
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// The device answered, but with something we cannot use.
    #[error("device protocol error: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for DeviceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Unreachable(err.to_string())
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
}

impl From<rumqttc::ClientError> for BrokerError {
    fn from(err: rumqttc::ClientError) -> Self {
        Self::Unreachable(err.to_string())
    }
}

/// An inbound payload that is not one of the accepted relay commands.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unrecognized command payload {payload:?}")]
pub struct CommandDecodeError {
    pub payload: String,
}

pub type DeviceResult<T> = Result<T, DeviceError>;
