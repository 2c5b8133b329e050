use crate::config::ConfigError;
use crate::ports::gateway::GatewayError;
use std::error::Error;
use std::fmt;

/// Errors surfaced by the engine and its control surface.
///
/// Statistics that are merely undefined (too little history, zero variance)
/// are modelled as `Option` at the call site and never reach this type.
#[derive(Debug)]
pub enum EngineError {
    /// Candles or prices for one asset could not be obtained.
    DataUnavailable { asset: String, reason: String },
    /// Not enough samples to derive a statistic for a pair.
    InsufficientHistory { pair_id: String },
    /// Venue call failed; only the current attempt is abandoned.
    Gateway(GatewayError),
    /// Store read/write failed; the current step is aborted with no partial writes.
    Persistence(String),
    /// Configuration update rejected; the previous configuration stays active.
    ConfigValidation(String),
}

impl EngineError {
    pub fn data_unavailable(asset: &str, reason: impl Into<String>) -> Self {
        EngineError::DataUnavailable {
            asset: asset.to_string(),
            reason: reason.into(),
        }
    }

    pub fn persistence(detail: impl Into<String>) -> Self {
        EngineError::Persistence(detail.into())
    }

    /// Errors that fail a single item of a cycle without aborting it.
    pub fn is_per_item(&self) -> bool {
        matches!(
            self,
            EngineError::DataUnavailable { .. }
                | EngineError::InsufficientHistory { .. }
                | EngineError::Gateway(_)
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::DataUnavailable { asset, reason } => {
                write!(f, "data unavailable for {}: {}", asset, reason)
            }
            EngineError::InsufficientHistory { pair_id } => {
                write!(f, "insufficient history for {}", pair_id)
            }
            EngineError::Gateway(e) => write!(f, "gateway error: {}", e),
            EngineError::Persistence(e) => write!(f, "persistence error: {}", e),
            EngineError::ConfigValidation(e) => write!(f, "invalid configuration: {}", e),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EngineError::Gateway(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GatewayError> for EngineError {
    fn from(err: GatewayError) -> EngineError {
        EngineError::Gateway(err)
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> EngineError {
        EngineError::ConfigValidation(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> EngineError {
        EngineError::Persistence(format!("encode/decode: {}", err))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> EngineError {
        EngineError::Persistence(format!("io: {}", err))
    }
}
