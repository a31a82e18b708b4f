use std::fmt;

use thiserror::Error;

/// Error type returned by every fallible operation of this crate.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    WorkerError(WorkerErrorKind),
    RouterError(RouterErrorKind),
    TransportError(TransportErrorKind),
    ProducerError(ProducerErrorKind),
    ConsumerError(ConsumerErrorKind),
    SessionError(SessionErrorKind),
    ConfigError(ConfigErrorKind),
    SignalingError(SignalingErrorKind),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::WorkerError(kind) => write!(f, "WorkerError({:?})", kind),
            ErrorKind::RouterError(kind) => write!(f, "RouterError({:?})", kind),
            ErrorKind::TransportError(kind) => write!(f, "TransportError({:?})", kind),
            ErrorKind::ProducerError(kind) => write!(f, "ProducerError({:?})", kind),
            ErrorKind::ConsumerError(kind) => write!(f, "ConsumerError({:?})", kind),
            ErrorKind::SessionError(kind) => write!(f, "SessionError({:?})", kind),
            ErrorKind::ConfigError(kind) => write!(f, "ConfigError({:?})", kind),
            ErrorKind::SignalingError(kind) => write!(f, "SignalingError({:?})", kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerErrorKind {
    CertificateError,
    WorkerDiedError,
    PortExhaustedError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterErrorKind {
    RouterNotCreatedError,
    RouterClosedError,
    UnsupportedCodecError,
    InvalidCodecError,
    PayloadTypeExhaustedError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportErrorKind {
    TransportClosedError,
    NotConnectedError,
    AlreadyConnectedError,
    InvalidDtlsParametersError,
    InvalidListenIpsError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerErrorKind {
    ProducerNotFoundError,
    ProducerClosedError,
    InvalidRtpParametersError,
    UnsupportedCodecError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerErrorKind {
    ConsumerNotFoundError,
    ConsumerClosedError,
    CapabilityMismatchError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionErrorKind {
    RoomNotCreatedError,
    TransportNotCreatedError,
    SessionClosedError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigErrorKind {
    InvalidValueError,
    InvalidPortRangeError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingErrorKind {
    MalformedMessageError,
    UnknownEventError,
}

impl Error {
    pub fn new_worker(message: String, kind: WorkerErrorKind) -> Self {
        Self {
            kind: ErrorKind::WorkerError(kind),
            message,
        }
    }

    pub fn new_router(message: String, kind: RouterErrorKind) -> Self {
        Self {
            kind: ErrorKind::RouterError(kind),
            message,
        }
    }

    pub fn new_transport(message: String, kind: TransportErrorKind) -> Self {
        Self {
            kind: ErrorKind::TransportError(kind),
            message,
        }
    }

    pub fn new_producer(message: String, kind: ProducerErrorKind) -> Self {
        Self {
            kind: ErrorKind::ProducerError(kind),
            message,
        }
    }

    pub fn new_consumer(message: String, kind: ConsumerErrorKind) -> Self {
        Self {
            kind: ErrorKind::ConsumerError(kind),
            message,
        }
    }

    pub fn new_session(message: String, kind: SessionErrorKind) -> Self {
        Self {
            kind: ErrorKind::SessionError(kind),
            message,
        }
    }

    pub fn new_config(message: String, kind: ConfigErrorKind) -> Self {
        Self {
            kind: ErrorKind::ConfigError(kind),
            message,
        }
    }

    pub fn new_signaling(message: String, kind: SignalingErrorKind) -> Self {
        Self {
            kind: ErrorKind::SignalingError(kind),
            message,
        }
    }

    /// Stable identifier sent to clients in the `error.kind` field.
    pub fn code(&self) -> &'static str {
        match &self.kind {
            ErrorKind::WorkerError(WorkerErrorKind::PortExhaustedError) => "resourceExhausted",
            ErrorKind::WorkerError(WorkerErrorKind::WorkerDiedError) => "closed",
            ErrorKind::WorkerError(WorkerErrorKind::CertificateError) => "internal",
            ErrorKind::RouterError(RouterErrorKind::RouterNotCreatedError) => "invalidState",
            ErrorKind::RouterError(RouterErrorKind::RouterClosedError) => "closed",
            ErrorKind::RouterError(RouterErrorKind::UnsupportedCodecError) => "unsupportedCodec",
            ErrorKind::RouterError(RouterErrorKind::InvalidCodecError) => "invalidParameters",
            ErrorKind::RouterError(RouterErrorKind::PayloadTypeExhaustedError) => {
                "resourceExhausted"
            }
            ErrorKind::TransportError(TransportErrorKind::TransportClosedError) => "closed",
            ErrorKind::TransportError(TransportErrorKind::NotConnectedError)
            | ErrorKind::TransportError(TransportErrorKind::AlreadyConnectedError) => {
                "invalidState"
            }
            ErrorKind::TransportError(TransportErrorKind::InvalidDtlsParametersError)
            | ErrorKind::TransportError(TransportErrorKind::InvalidListenIpsError) => {
                "invalidParameters"
            }
            ErrorKind::ProducerError(ProducerErrorKind::ProducerNotFoundError) => "notFound",
            ErrorKind::ProducerError(ProducerErrorKind::ProducerClosedError) => "closed",
            ErrorKind::ProducerError(ProducerErrorKind::InvalidRtpParametersError) => {
                "invalidParameters"
            }
            ErrorKind::ProducerError(ProducerErrorKind::UnsupportedCodecError) => {
                "unsupportedCodec"
            }
            ErrorKind::ConsumerError(ConsumerErrorKind::ConsumerNotFoundError) => "notFound",
            ErrorKind::ConsumerError(ConsumerErrorKind::ConsumerClosedError) => "closed",
            ErrorKind::ConsumerError(ConsumerErrorKind::CapabilityMismatchError) => {
                "capabilityMismatch"
            }
            ErrorKind::SessionError(SessionErrorKind::RoomNotCreatedError)
            | ErrorKind::SessionError(SessionErrorKind::TransportNotCreatedError) => {
                "invalidState"
            }
            ErrorKind::SessionError(SessionErrorKind::SessionClosedError) => "closed",
            ErrorKind::ConfigError(_) => "invalidParameters",
            ErrorKind::SignalingError(_) => "invalidParameters",
        }
    }

    /// Whether this error reports an operation issued in the wrong order.
    pub fn is_invalid_state(&self) -> bool {
        self.code() == "invalidState"
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new_signaling(err.to_string(), SignalingErrorKind::MalformedMessageError)
    }
}
