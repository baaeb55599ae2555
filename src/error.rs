//! Error types and handling for the tunnel supervision core

use thiserror::Error;

/// Main error type for tunnel/proxy supervision operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The engine config file backing the session is missing, empty, or
    /// unreadable at the point interface construction needs it
    #[error("Invalid session config: {0}")]
    ConfigInvalid(String),

    /// The OS refused to establish the virtual network interface
    #[error("Failed to establish virtual interface: {0}")]
    InterfaceEstablishFailed(String),

    /// The native tunnel engine rejected the fd or config
    #[error("Tunnel engine failed to start: {0}")]
    EngineStartFailed(String),

    /// The proxy subprocess could not be spawned at all
    #[error("Failed to launch proxy process: {0}")]
    ProxyLaunchFailed(String),

    /// The proxy subprocess crashed past the restart limit
    #[error("Proxy process failed permanently after {attempts} launch attempts")]
    ProxyFatal { attempts: u32 },

    /// Operation invalid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A bounded wait expired
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

impl From<toml::de::Error> for TunnelError {
    fn from(err: toml::de::Error) -> Self {
        TunnelError::ConfigInvalid(format!("TOML parsing error: {err}"))
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(err: serde_json::Error) -> Self {
        TunnelError::ConfigInvalid(format!("JSON error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::ConfigInvalid("missing file".to_string());
        assert_eq!(err.to_string(), "Invalid session config: missing file");

        let err = TunnelError::ProxyFatal { attempts: 4 };
        assert!(err.to_string().contains("4 launch attempts"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TunnelError = io_err.into();
        assert!(matches!(err, TunnelError::Io(_)));
    }

    #[test]
    fn test_toml_error_conversion() {
        let parse_err = "not = = toml".parse::<toml::Table>().unwrap_err();
        let err: TunnelError = parse_err.into();
        assert!(matches!(err, TunnelError::ConfigInvalid(_)));
    }
}
