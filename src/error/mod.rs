use thiserror::Error;

use crate::types::ErrorResult;

/// CNI error code for an unsupported `cniVersion`
pub const CODE_INCOMPATIBLE_VERSION: u32 = 1;
/// CNI error code for missing or malformed `CNI_*` variables
pub const CODE_INVALID_ENVIRONMENT: u32 = 4;
/// CNI error code for I/O failures
pub const CODE_IO_FAILURE: u32 = 5;
/// CNI error code for an invalid network configuration
pub const CODE_INVALID_NETWORK_CONFIG: u32 = 7;

/// Errors surfaced by the plugin.
///
/// Every variant maps onto a CNI error code so the runtime receives a
/// well-formed error result instead of free-form text.
#[derive(Debug, Error)]
pub enum CniError {
    #[error("invalid network configuration: {0}")]
    Config(String),

    #[error("namespace: {0}")]
    Namespace(String),

    #[error("link: {0}")]
    Link(String),

    #[error("address: {0}")]
    Address(String),

    #[error("route: {0}")]
    Route(String),

    #[error("{0} not supported")]
    Unsupported(String),

    #[error("incompatible CNI version {0}")]
    IncompatibleVersion(String),

    #[error("invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl CniError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CniError::Io {
            context: context.into(),
            source,
        }
    }

    /// CNI error code reported to the runtime.
    pub fn code(&self) -> u32 {
        match self {
            CniError::IncompatibleVersion(_) => CODE_INCOMPATIBLE_VERSION,
            CniError::InvalidEnvironment(_) => CODE_INVALID_ENVIRONMENT,
            CniError::Io { .. } => CODE_IO_FAILURE,
            CniError::Config(_) => CODE_INVALID_NETWORK_CONFIG,
            CniError::Unsupported(_) => 100,
            CniError::Namespace(_) => 101,
            CniError::Link(_) => 102,
            CniError::Address(_) => 103,
            CniError::Route(_) => 104,
        }
    }

    /// Render as the JSON error object defined by the CNI spec.
    pub fn to_result(&self, cni_version: &str) -> ErrorResult {
        let details = match self {
            CniError::Io { source, .. } => source.to_string(),
            _ => String::new(),
        };

        ErrorResult {
            cni_version: cni_version.to_string(),
            code: self.code(),
            msg: self.to_string(),
            details,
        }
    }
}

impl From<serde_json::Error> for CniError {
    fn from(err: serde_json::Error) -> Self {
        CniError::Config(err.to_string())
    }
}

pub type Result<T, E = CniError> = std::result::Result<T, E>;
