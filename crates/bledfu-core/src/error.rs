//! Upload failure taxonomy.

use thiserror::Error;

use crate::protocol::RecordError;
use crate::state::DfuState;
use crate::sync::SyncError;
use crate::transport::TransportError;

/// Why an upload ended in the aborted state.
#[derive(Error, Debug)]
pub enum UploadError {
    /// A characteristic write failed. Nothing further was written.
    #[error("Transport error in {state}: {source}")]
    Transport {
        state: DfuState,
        #[source]
        source: TransportError,
    },

    /// An acknowledgment did not arrive in time. The link was dropped.
    #[error("Timed out after {timeout_ms}ms waiting for acknowledgment in {state}")]
    Timeout { state: DfuState, timeout_ms: u64 },

    /// Rejected before anything was written.
    #[error("Image of {size} bytes exceeds the {max} byte limit")]
    ImageTooLarge { size: usize, max: usize },

    /// Internal invariant broken. This is a bug, not a device condition.
    #[error("Protocol violation in {state}: {message}")]
    ProtocolViolation { state: DfuState, message: String },

    /// The caller cancelled the upload.
    #[error("Upload cancelled in {state}")]
    Cancelled { state: DfuState },
}

impl UploadError {
    pub(crate) fn from_sync(state: DfuState, err: SyncError) -> Self {
        match err {
            SyncError::Timeout { timeout_ms } => UploadError::Timeout { state, timeout_ms },
            SyncError::Cancelled => UploadError::Cancelled { state },
            other => UploadError::ProtocolViolation {
                state,
                message: other.to_string(),
            },
        }
    }

    /// Check if the link should be torn down for a clean retry.
    pub fn needs_disconnect(&self) -> bool {
        matches!(
            self,
            UploadError::Timeout { .. } | UploadError::Cancelled { .. }
        )
    }
}

impl From<RecordError> for UploadError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::TooLarge { size, max } => UploadError::ImageTooLarge { size, max },
            other => UploadError::ProtocolViolation {
                state: DfuState::SizeSent,
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_mapping() {
        let err = UploadError::from_sync(
            DfuState::AwaitingSizeAck,
            SyncError::Timeout { timeout_ms: 100 },
        );
        assert!(matches!(err, UploadError::Timeout { timeout_ms: 100, .. }));
        assert!(err.needs_disconnect());

        let err = UploadError::from_sync(DfuState::Streaming, SyncError::NotArmed);
        assert!(matches!(err, UploadError::ProtocolViolation { .. }));
        assert!(!err.needs_disconnect());

        let err = UploadError::from_sync(
            DfuState::Streaming,
            SyncError::AlreadyArmed { outstanding: 2 },
        );
        assert!(matches!(err, UploadError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_display() {
        let err = UploadError::Timeout {
            state: DfuState::AwaitingValidateAck,
            timeout_ms: 5000,
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 5000ms waiting for acknowledgment in AWAITING_VALIDATE_ACK"
        );
    }
}
