//! Membership diffing in both directions.
//!
//! The membership mirror is always written before the access mirror, so a failure
//! between the two writes leaves the access mirror a subset of the membership mirror.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StoreResultExt, SyncResult};
use crate::model::{
    CommunityGroupId, CommunityMemberId, CommunityMembership, ContactId, DirectoryGroupId,
    GroupPair, MemberAction, MembershipRecord, MembershipStatus, MirrorKind, Role,
};
use crate::reconciler::{Reconciler, SkipReason};

/// A membership change on the Community side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct MembershipChange {
    pub action: MemberAction,
    /// Role after an add, or the role held when leaving on a remove.
    pub role: Role,
    /// Role before the change, when the caller knows it.
    pub previous_role: Option<Role>,
}

impl MembershipChange {
    #[must_use]
    pub fn add(role: Role) -> Self {
        Self { action: MemberAction::Add, role, previous_role: None }
    }

    #[must_use]
    pub fn remove(role: Role) -> Self {
        Self { action: MemberAction::Remove, role, previous_role: Some(role) }
    }

    #[must_use]
    pub fn promote() -> Self {
        Self { action: MemberAction::Add, role: Role::Admin, previous_role: Some(Role::Member) }
    }

    #[must_use]
    pub fn demote() -> Self {
        Self { action: MemberAction::Add, role: Role::Member, previous_role: Some(Role::Admin) }
    }

    /// Plain joins of non-admins never touch the access mirror.
    fn touches_access(self) -> bool {
        self.role == Role::Admin || self.previous_role == Some(Role::Admin)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SyncOutcome {
    pub membership_changed: bool,
    pub access_changed: bool,
    pub skipped: Option<SkipReason>,
}

impl SyncOutcome {
    #[must_use]
    pub fn skipped(reason: SkipReason) -> Self {
        Self { skipped: Some(reason), ..Self::default() }
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        !self.membership_changed && !self.access_changed
    }
}

impl Reconciler<'_> {
    /// Converge one member's mirror records with a Community membership change.
    ///
    /// # Errors
    /// Propagates collaborator failures; a member without a contact is a skip.
    pub fn sync_membership(
        &mut self,
        group: CommunityGroupId,
        pair: GroupPair,
        member: CommunityMemberId,
        change: MembershipChange,
    ) -> SyncResult<SyncOutcome> {
        let Some(contact) = self.resolve_contact(member)? else {
            return Ok(SyncOutcome::skipped(SkipReason::NoContact));
        };

        let mut outcome = SyncOutcome::default();
        let status = match change.action {
            MemberAction::Add => Some(self.present_status(member)?),
            MemberAction::Remove => None,
        };

        outcome.membership_changed = match status {
            Some(status) => self.upsert_status(pair.membership, contact, status)?,
            None => self.soft_delete(pair.membership, contact)?,
        };

        // A leaver loses admin rights whatever role the caller reported.
        let revoke = status.is_none() || change.touches_access();
        outcome.access_changed = match (status, change.role) {
            (Some(status), Role::Admin) => self.upsert_status(pair.access, contact, status)?,
            _ if revoke => self.soft_delete(pair.access, contact)?,
            _ => false,
        };

        if outcome.is_noop() {
            debug!("member {member} of community group {group} already in sync");
        } else {
            info!(
                "synced member {member} of community group {group}: \
                 membership_changed={} access_changed={}",
                outcome.membership_changed, outcome.access_changed
            );
        }
        Ok(outcome)
    }

    /// Converge the Community side with a contact added to or removed from a mirror group.
    ///
    /// # Errors
    /// Propagates collaborator failures; unknown groups or contacts are skips.
    pub fn sync_contact(
        &mut self,
        group: DirectoryGroupId,
        contact: ContactId,
        action: MemberAction,
    ) -> SyncResult<SyncOutcome> {
        let Some((community_group, kind)) = self.resolve_mirror(group)? else {
            return Ok(SyncOutcome::skipped(SkipReason::NotMirrorGroup));
        };
        let Some(member) = self.resolve_member(contact)? else {
            return Ok(SyncOutcome::skipped(SkipReason::NoMember));
        };
        if self.stores.community.group_get(community_group).during("group.get")?.is_none() {
            return Ok(SyncOutcome::skipped(SkipReason::NoCommunityGroup));
        }

        let community = self.stores.community;
        let mut outcome = SyncOutcome::default();
        match (kind, action) {
            (MirrorKind::Membership, MemberAction::Add) => {
                outcome.membership_changed = self.ensure_community_member(community_group, member)?;
            }
            (MirrorKind::Membership, MemberAction::Remove) => {
                if community.is_member(community_group, member).during("member.is_member")? {
                    community.remove_member(community_group, member).during("member.remove")?;
                    outcome.membership_changed = true;
                }
                // Leaving the group ends admin rights; keep the access mirror a subset.
                if let Some(pair) = self.resolve_pair(community_group)? {
                    outcome.access_changed = self.soft_delete(pair.access, contact)?;
                }
            }
            (MirrorKind::AccessControl, MemberAction::Add) => {
                if let Some(pair) = self.resolve_pair(community_group)? {
                    let status = self.present_status(member)?;
                    if self.ensure_present(pair.membership, contact, status)? {
                        info!("restored missing membership mirror record for contact {contact}");
                    }
                }
                outcome.membership_changed = self.ensure_community_member(community_group, member)?;
                if !community.is_admin(community_group, member).during("member.is_admin")? {
                    community.promote(community_group, member).during("member.promote")?;
                    outcome.access_changed = true;
                }
            }
            (MirrorKind::AccessControl, MemberAction::Remove) => {
                if community.is_admin(community_group, member).during("member.is_admin")? {
                    community.demote(community_group, member).during("member.demote")?;
                    outcome.access_changed = true;
                }
            }
        }

        if !outcome.is_noop() {
            info!(
                "synced contact {contact} into community group {community_group}: \
                 membership_changed={} access_changed={}",
                outcome.membership_changed, outcome.access_changed
            );
        }
        Ok(outcome)
    }

    /// Soft-delete a mirror record whose Community counterpart no longer exists.
    ///
    /// # Errors
    /// Propagates collaborator failures.
    pub fn prune_mirror_membership(&mut self, record: MembershipRecord) -> SyncResult<SyncOutcome> {
        if !record.status.is_present() {
            return Ok(SyncOutcome::default());
        }
        let Some((community_group, kind)) = self.resolve_mirror(record.group)? else {
            return Ok(SyncOutcome::skipped(SkipReason::NotMirrorGroup));
        };

        let keep = match self.resolve_member(record.contact)? {
            None => false,
            Some(member) => match kind {
                MirrorKind::Membership => self
                    .stores
                    .community
                    .is_member(community_group, member)
                    .during("member.is_member")?,
                MirrorKind::AccessControl => self
                    .stores
                    .community
                    .is_admin(community_group, member)
                    .during("member.is_admin")?,
            },
        };
        if keep {
            return Ok(SyncOutcome::default());
        }

        self.stores
            .directory
            .membership_set_status(record.group, record.contact, MembershipStatus::Removed)
            .during("membership.delete")?;
        info!(
            "removed stale {} mirror record for contact {} in group {}",
            kind.as_str(),
            record.contact,
            record.group
        );
        let mut outcome = SyncOutcome::default();
        match kind {
            MirrorKind::Membership => {
                outcome.membership_changed = true;
                if let Some(pair) = self.resolve_pair(community_group)? {
                    outcome.access_changed = self.soft_delete(pair.access, record.contact)?;
                }
            }
            MirrorKind::AccessControl => outcome.access_changed = true,
        }
        Ok(outcome)
    }

    /// Remove or demote a Community member the mirrors no longer list.
    ///
    /// Groups without a mirror pair and members without a contact are skipped: the
    /// Directory has never described them.
    ///
    /// # Errors
    /// Propagates collaborator failures.
    pub fn prune_community_membership(
        &mut self,
        membership: CommunityMembership,
    ) -> SyncResult<SyncOutcome> {
        let Some(pair) = self.resolve_pair(membership.group)? else {
            return Ok(SyncOutcome::skipped(SkipReason::NoPair));
        };
        let Some(contact) = self.resolve_contact(membership.member)? else {
            return Ok(SyncOutcome::skipped(SkipReason::NoContact));
        };

        let community = self.stores.community;
        if !self.is_present(pair.membership, contact)? {
            community.remove_member(membership.group, membership.member).during("member.remove")?;
            info!(
                "removed member {} from community group {}: absent from membership mirror",
                membership.member, membership.group
            );
            return Ok(SyncOutcome { membership_changed: true, ..SyncOutcome::default() });
        }
        if membership.role == Role::Admin && !self.is_present(pair.access, contact)? {
            community.demote(membership.group, membership.member).during("member.demote")?;
            info!(
                "demoted member {} in community group {}: absent from access mirror",
                membership.member, membership.group
            );
            return Ok(SyncOutcome { access_changed: true, ..SyncOutcome::default() });
        }
        Ok(SyncOutcome::default())
    }

    fn present_status(&self, member: CommunityMemberId) -> SyncResult<MembershipStatus> {
        let active = self.stores.community.is_active(member).during("member.is_active")?;
        Ok(if active { MembershipStatus::Added } else { MembershipStatus::Pending })
    }

    fn ensure_community_member(
        &self,
        group: CommunityGroupId,
        member: CommunityMemberId,
    ) -> SyncResult<bool> {
        let community = self.stores.community;
        if community.is_member(group, member).during("member.is_member")? {
            return Ok(false);
        }
        community.add_member(group, member).during("member.add")?;
        Ok(true)
    }

    fn is_present(&self, group: DirectoryGroupId, contact: ContactId) -> SyncResult<bool> {
        Ok(self
            .stores
            .directory
            .membership_get(group, contact)
            .during("membership.get")?
            .is_some_and(|record| record.status.is_present()))
    }

    /// Write `status` unless the record already carries it. Removed records are
    /// re-tagged rather than duplicated.
    fn upsert_status(
        &self,
        group: DirectoryGroupId,
        contact: ContactId,
        status: MembershipStatus,
    ) -> SyncResult<bool> {
        let directory = self.stores.directory;
        match directory.membership_get(group, contact).during("membership.get")? {
            None => {
                directory.membership_create(group, contact, status).during("membership.create")?;
                Ok(true)
            }
            Some(existing) if existing.status == status => Ok(false),
            Some(_) => {
                directory
                    .membership_set_status(group, contact, status)
                    .during("membership.update")?;
                Ok(true)
            }
        }
    }

    /// Like `upsert_status` but leaves an already-present record alone.
    fn ensure_present(
        &self,
        group: DirectoryGroupId,
        contact: ContactId,
        status: MembershipStatus,
    ) -> SyncResult<bool> {
        if self.is_present(group, contact)? {
            return Ok(false);
        }
        self.upsert_status(group, contact, status)
    }

    fn soft_delete(&self, group: DirectoryGroupId, contact: ContactId) -> SyncResult<bool> {
        let directory = self.stores.directory;
        match directory.membership_get(group, contact).during("membership.get")? {
            Some(existing) if existing.status.is_present() => {
                directory
                    .membership_set_status(group, contact, MembershipStatus::Removed)
                    .during("membership.delete")?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
