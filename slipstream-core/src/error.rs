use thiserror::Error;

/// Slipstream core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Authentication failed: {message}")]
    Auth { message: String },

    #[error("Relay refused CONNECT: code {code}")]
    Connect { code: u8 },

    #[error("Timeout: {message}")]
    Timeout {
        message: String,
        operation: Option<String>,
    },

    #[error("Session closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new transport error with source
    pub fn transport_with_source<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new authentication error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a new timeout error naming the operation
    pub fn timeout_in<S: Into<String>, O: Into<String>>(message: S, operation: O) -> Self {
        Self::Timeout {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get error code/category for external use
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "CONFIG",
            Self::Transport { .. } => "TRANSPORT",
            Self::Protocol { .. } => "PROTOCOL",
            Self::Auth { .. } => "AUTH",
            Self::Connect { .. } => "CONNECT",
            Self::Timeout { .. } => "TIMEOUT",
            Self::SessionClosed => "SESSION_CLOSED",
            Self::Io(_) => "IO",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Check if retrying the operation can succeed.
    ///
    /// Transport failures and timeouts are transient; handshake protocol
    /// violations and HMAC mismatches are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::Io(_) => true,
            Self::Config { .. } | Self::Protocol { .. } | Self::Auth { .. } => false,
            Self::Connect { .. } | Self::SessionClosed | Self::Internal { .. } => false,
        }
    }
}
