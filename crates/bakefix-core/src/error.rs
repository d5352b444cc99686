use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to query module information: {0}")]
    ModuleQueryFailed(String),

    #[error("No match for {0}")]
    AnchorNotFound(&'static str),

    #[error("Failed to change protection at address {address:#x}: {message}")]
    ProtectFailed { address: usize, message: String },

    #[error("Failed to flush instruction cache at address {address:#x}: {message}")]
    FlushFailed { address: usize, message: String },

    #[error("Invalid setting name: {0}")]
    InvalidSettingName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error just means a signature had zero matches
    pub fn is_anchor_not_found(&self) -> bool {
        matches!(self, Error::AnchorNotFound(_))
    }
}
