//! Collaborator interfaces consumed by the reconciliation engine.
//!
//! Implementations own their record stores; every call is synchronous and
//! fallible with no internal retry. Callers decide whether to retry.

use crate::error::StoreError;
use crate::model::{
    CommunityGroup, CommunityGroupId, CommunityMemberId, CommunityMembership, ContactId,
    DirectoryGroup, DirectoryGroupDraft, DirectoryGroupId, GroupPair, MembershipRecord,
    MembershipStatus,
};
use crate::stepper::CursorState;

pub type StoreResult<T> = Result<T, StoreError>;

/// The group/membership platform with single-parent groups and admin members.
pub trait CommunityStore {
    fn group_get(&self, group: CommunityGroupId) -> StoreResult<Option<CommunityGroup>>;

    fn group_total_count(&self) -> StoreResult<u64>;

    fn is_member(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<bool>;

    fn is_admin(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<bool>;

    /// Whether the member's account is active. Inactive members mirror as Pending.
    fn is_active(&self, member: CommunityMemberId) -> StoreResult<bool>;

    fn add_member(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<()>;

    /// Physically removes the membership (and any admin status with it).
    fn remove_member(&self, group: CommunityGroupId, member: CommunityMemberId)
        -> StoreResult<()>;

    fn promote(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<()>;

    fn demote(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<()>;

    /// Memberships across all groups in a stable order.
    fn memberships_page(&self, offset: u64, limit: u64) -> StoreResult<Vec<CommunityMembership>>;

    fn membership_count(&self) -> StoreResult<u64>;
}

/// The contact directory with nestable groups and soft-deleted memberships.
pub trait DirectoryStore {
    fn group_create(&self, draft: &DirectoryGroupDraft) -> StoreResult<DirectoryGroupId>;

    fn group_update(&self, group: DirectoryGroupId, draft: &DirectoryGroupDraft)
        -> StoreResult<()>;

    fn group_delete(&self, group: DirectoryGroupId) -> StoreResult<()>;

    fn group_get_by_id(&self, group: DirectoryGroupId) -> StoreResult<Option<DirectoryGroup>>;

    /// Every group whose source tag equals `source`. More than one hit is data corruption.
    fn group_get_by_source(&self, source: &str) -> StoreResult<Vec<DirectoryGroup>>;

    fn membership_get(
        &self,
        group: DirectoryGroupId,
        contact: ContactId,
    ) -> StoreResult<Option<MembershipRecord>>;

    /// Insert a new record. Callers check `membership_get` first; re-entry goes through
    /// [`DirectoryStore::membership_set_status`].
    fn membership_create(
        &self,
        group: DirectoryGroupId,
        contact: ContactId,
        status: MembershipStatus,
    ) -> StoreResult<()>;

    /// Re-tag an existing record. Removal is `Removed`, never a physical delete.
    fn membership_set_status(
        &self,
        group: DirectoryGroupId,
        contact: ContactId,
        status: MembershipStatus,
    ) -> StoreResult<()>;

    /// Membership records of every mirror group (both kinds, all statuses) in a stable order.
    fn mirror_memberships_page(&self, offset: u64, limit: u64)
        -> StoreResult<Vec<MembershipRecord>>;

    fn mirror_membership_count(&self) -> StoreResult<u64>;

    fn hierarchy_parents(&self, child: DirectoryGroupId) -> StoreResult<Vec<DirectoryGroupId>>;

    fn hierarchy_create(&self, child: DirectoryGroupId, parent: DirectoryGroupId)
        -> StoreResult<()>;

    fn hierarchy_delete(&self, child: DirectoryGroupId, parent: DirectoryGroupId)
        -> StoreResult<()>;

    fn contact_id_by_member_id(&self, member: CommunityMemberId) -> StoreResult<Option<ContactId>>;

    fn member_id_by_contact_id(&self, contact: ContactId) -> StoreResult<Option<CommunityMemberId>>;
}

/// Grants members of an access mirror elevated rights over its membership mirror.
pub trait AclLinker {
    /// Idempotent: linking an already-linked pair succeeds.
    fn link(&self, access: DirectoryGroupId, membership: DirectoryGroupId) -> StoreResult<()>;

    fn unlink(&self, access: DirectoryGroupId, membership: DirectoryGroupId) -> StoreResult<()>;
}

/// Explicit, indexed mapping from a Community group to its mirror pair.
pub trait CorrespondenceStore {
    fn pair_get(&self, group: CommunityGroupId) -> StoreResult<Option<GroupPair>>;

    fn pair_put(&self, group: CommunityGroupId, pair: GroupPair) -> StoreResult<()>;

    fn pair_forget(&self, group: CommunityGroupId) -> StoreResult<()>;
}

/// A held claim on one batch identifier.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Lease {
    pub batch_id: String,
    pub holder: String,
}

/// Durable cursor state plus per-identifier mutual exclusion.
pub trait CursorStore {
    fn cursor_load(&self, batch_id: &str) -> StoreResult<Option<CursorState>>;

    fn cursor_save(&self, cursor: &CursorState) -> StoreResult<()>;

    fn cursor_delete(&self, batch_id: &str) -> StoreResult<()>;

    /// Claim `batch_id`, taking over a lease older than `stale_after_secs`.
    /// Returns `None` while another invocation holds a fresh lease.
    fn try_acquire(&self, batch_id: &str, stale_after_secs: u64) -> StoreResult<Option<Lease>>;

    fn release(&self, lease: &Lease) -> StoreResult<()>;
}
