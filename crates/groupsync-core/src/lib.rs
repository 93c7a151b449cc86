//! Bidirectional group and membership reconciliation between a Community system and
//! a Directory system.

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod hierarchy;
pub mod membership;
pub mod model;
mod pair;
pub mod reconciler;
pub mod stepper;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheStats, CorrespondenceCache, Lookup};
pub use config::{ContainerConfig, SyncConfig, DEFAULT_PAGE_SIZE};
pub use controller::{phase_label, BatchController, PageTally, RunReport, StepReport, StepStatus};
pub use error::{StoreError, SyncError, SyncResult};
pub use events::{EventKind, EventOutcome, Origin, SyncEvent};
pub use hierarchy::HierarchyOutcome;
pub use membership::{MembershipChange, SyncOutcome};
pub use model::{
    CommunityGroup, CommunityGroupId, CommunityMemberId, CommunityMembership, ContactId,
    Direction, DirectoryGroup, DirectoryGroupDraft, DirectoryGroupId, DirectoryGroupKind,
    GroupPair, MemberAction, MembershipRecord, MembershipStatus, MirrorKind, Role,
};
pub use reconciler::{Collaborators, Reconciler, SkipReason};
pub use stepper::{CursorState, Phase, StepRange, Stepper};
pub use traits::{
    AclLinker, CommunityStore, CorrespondenceStore, CursorStore, DirectoryStore, Lease,
    StoreResult,
};
