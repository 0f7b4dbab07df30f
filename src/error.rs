use thiserror::Error;

pub type Result<T> = std::result::Result<T, StrataError>;

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("entry not found")]
    NotFound,

    #[error("entry already exists")]
    AlreadyExists,

    #[error("stale reference: {0}")]
    StaleReference(String),

    #[error("operation would require a full cross-layer copy: {0}")]
    CrossLayerUnsupported(String),

    #[error("metadata marking unsupported by upper store: {0}")]
    MetadataUnsupported(String),

    #[error("directory not empty")]
    NotEmpty,

    #[error("inconsistent union state: {0}")]
    Inconsistent(String),

    #[error("storage error: {0}")]
    Io(String),
}

impl StrataError {
    /// True for the error kinds a caller may handle by falling back to a
    /// non-layer-aware copy strategy instead of failing the whole request.
    pub fn is_fallback_hint(&self) -> bool {
        matches!(
            self,
            StrataError::CrossLayerUnsupported(_) | StrataError::MetadataUnsupported(_)
        )
    }
}
