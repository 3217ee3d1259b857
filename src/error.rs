//! Error taxonomy shared by the host runtime and the format adapters.
//!
//! Lifecycle failures carry a short description of what the plugin reported;
//! the adapters map ABI result codes into these variants so the sequencer and
//! its callers never see format-specific codes.

/// Host-level error returned by plugin lifecycle and processing operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// Plugin bundle could not be loaded or its entry point is missing.
    #[error("Failed to instantiate plugin: {0}")]
    FailedToInstantiate(String),
    /// Setup call returned non-OK or a required channel layout could not be
    /// negotiated.
    #[error("Failed to configure plugin: {0}")]
    FailedToConfigure(String),
    #[error("Failed to start processing: {0}")]
    FailedToStartProcessing(String),
    #[error("Failed to stop processing: {0}")]
    FailedToStopProcessing(String),
    /// The plugin returned a processing error for this block. The block is
    /// discarded but the stream continues.
    #[error("Failed to process audio block: {0}")]
    FailedToProcess(String),
    /// Parameter index out of range or a parameter read failed.
    #[error("Invalid parameter operation: {0}")]
    InvalidParameterOperation(String),
    /// An event buffer is full.
    #[error("Insufficient event buffer memory")]
    InsufficientMemory,
    /// The capability is absent on this plugin. Non-fatal for lifecycle
    /// operations the plugin chose not to implement.
    #[error("Not implemented by this plugin")]
    NotImplemented,
    #[error("Plugin already instantiated")]
    AlreadyInstantiated,
    #[error("Required interface not available: {0}")]
    NoInterface(String),
}

impl HostError {
    /// Whether this error should be tolerated for optional lifecycle calls.
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, HostError::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HostError::FailedToInstantiate("missing entry point".to_string());
        assert_eq!(
            err.to_string(),
            "Failed to instantiate plugin: missing entry point"
        );
        assert_eq!(
            HostError::InsufficientMemory.to_string(),
            "Insufficient event buffer memory"
        );
    }

    #[test]
    fn test_not_implemented_is_tolerated() {
        assert!(HostError::NotImplemented.is_not_implemented());
        assert!(!HostError::InsufficientMemory.is_not_implemented());
    }
}
