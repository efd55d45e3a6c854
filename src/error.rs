use thiserror::Error;

use crate::store::StoreError;

pub type CampusResult<T> = Result<T, CampusError>;

/// Every failure the sync layer reports. Each one is scoped to the view or
/// operation that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CampusError {
    #[error("Sign-in required")]
    AuthRequired,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl CampusError {
    /// Text shown inline on the originating form or view.
    pub fn user_message(&self) -> String {
        match self {
            CampusError::AuthRequired => "You must be signed in to do that".to_string(),
            CampusError::PermissionDenied(_) => "Not authorized".to_string(),
            CampusError::ValidationFailed(reason) => reason.clone(),
            CampusError::ChannelError(_) => "Live updates are unavailable".to_string(),
            CampusError::WriteFailed(_) => "Failed to save changes".to_string(),
            CampusError::NotFound(what) => format!("{what} not found"),
        }
    }

    /// Detected before any network call.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            CampusError::AuthRequired | CampusError::ValidationFailed(_)
        )
    }

    pub(crate) fn from_read(err: StoreError) -> Self {
        match err {
            StoreError::Denied(reason) => CampusError::PermissionDenied(reason),
            StoreError::MissingParent(path) => {
                CampusError::ValidationFailed(format!("{path} does not exist"))
            }
            StoreError::NotFound(path) => CampusError::NotFound(path),
            StoreError::Unavailable(reason) | StoreError::Malformed(reason) => {
                CampusError::ChannelError(reason)
            }
        }
    }

    pub(crate) fn from_write(err: StoreError) -> Self {
        match err {
            StoreError::Denied(reason) => CampusError::PermissionDenied(reason),
            StoreError::MissingParent(path) => {
                CampusError::ValidationFailed(format!("{path} does not exist"))
            }
            StoreError::NotFound(path) => CampusError::NotFound(path),
            StoreError::Unavailable(reason) | StoreError::Malformed(reason) => {
                CampusError::WriteFailed(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_by_direction() {
        let offline = StoreError::Unavailable("connection reset".into());
        assert_eq!(
            CampusError::from_read(offline.clone()),
            CampusError::ChannelError("connection reset".into())
        );
        assert_eq!(
            CampusError::from_write(offline),
            CampusError::WriteFailed("connection reset".into())
        );
        assert!(matches!(
            CampusError::from_write(StoreError::Denied("notes".into())),
            CampusError::PermissionDenied(_)
        ));
    }

    #[test]
    fn local_errors_are_flagged() {
        assert!(CampusError::AuthRequired.is_local());
        assert!(CampusError::ValidationFailed("x".into()).is_local());
        assert!(!CampusError::WriteFailed("x".into()).is_local());
        assert_eq!(
            CampusError::ValidationFailed("Comment cannot be empty".into()).user_message(),
            "Comment cannot be empty"
        );
    }
}
