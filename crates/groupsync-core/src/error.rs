use crate::model::{CommunityGroupId, DirectoryGroupId};

/// Typed failure returned by every collaborator store call.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    /// Network/database trouble; the same call may succeed later.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store refused the request; retrying will not help.
    #[error("store rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SyncError {
    #[error("transient failure during {operation}: {source}")]
    Transient { operation: &'static str, source: StoreError },
    #[error("store rejected {operation}: {source}")]
    Store { operation: &'static str, source: StoreError },
    #[error("access mirror creation failed for community group {group}: {message}")]
    PartialMirror { group: CommunityGroupId, message: String },
    #[error("orphaned membership mirror {mirror} of community group {group} needs manual cleanup")]
    OrphanedMirror { group: CommunityGroupId, mirror: DirectoryGroupId },
    #[error("access-control linkage failed for community group {group}: {message}")]
    AclLinkage { group: CommunityGroupId, message: String },
    #[error("ambiguous mapping: {0}")]
    Ambiguous(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("cursor store failure: {0}")]
    CursorStore(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl SyncError {
    /// Wrap a collaborator failure, keeping transient and permanent failures apart.
    #[must_use]
    pub fn from_store(operation: &'static str, source: StoreError) -> Self {
        match source {
            StoreError::Unavailable(_) => Self::Transient { operation, source },
            StoreError::Rejected(_) => Self::Store { operation, source },
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Adds operation context to collaborator results.
pub(crate) trait StoreResultExt<T> {
    fn during(self, operation: &'static str) -> SyncResult<T>;
}

impl<T> StoreResultExt<T> for Result<T, StoreError> {
    fn during(self, operation: &'static str) -> SyncResult<T> {
        self.map_err(|source| SyncError::from_store(operation, source))
    }
}
