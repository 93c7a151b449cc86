//! Dispatch of single change notifications from either system.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreResultExt, SyncResult};
use crate::hierarchy::HierarchyOutcome;
use crate::membership::{MembershipChange, SyncOutcome};
use crate::model::{
    CommunityGroupId, CommunityMemberId, ContactId, DirectoryGroupId, GroupPair, MemberAction, Role,
};
use crate::reconciler::{Reconciler, SkipReason};

/// Who caused a change. Changes the engine wrote itself come back as `Mirror`
/// notifications and are dropped so that the two directions cannot feed each other.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    #[default]
    User,
    Mirror,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    GroupCreated { group: CommunityGroupId },
    GroupUpdated { group: CommunityGroupId },
    GroupDeleted { group: CommunityGroupId },
    GroupReparented { group: CommunityGroupId, parent: Option<CommunityGroupId> },
    MemberJoined { group: CommunityGroupId, member: CommunityMemberId, role: Role },
    MemberLeft { group: CommunityGroupId, member: CommunityMemberId, role: Role },
    MemberPromoted { group: CommunityGroupId, member: CommunityMemberId },
    MemberDemoted { group: CommunityGroupId, member: CommunityMemberId },
    ContactAdded { group: DirectoryGroupId, contact: ContactId },
    ContactRemoved { group: DirectoryGroupId, contact: ContactId },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct SyncEvent {
    #[serde(default)]
    pub origin: Origin,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SyncEvent {
    #[must_use]
    pub fn user(kind: EventKind) -> Self {
        Self { origin: Origin::User, kind }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum EventOutcome {
    Suppressed,
    Skipped(SkipReason),
    Membership(SyncOutcome),
    Pair(GroupPair),
    PairDeleted(Option<GroupPair>),
    Hierarchy(HierarchyOutcome),
}

impl Reconciler<'_> {
    /// Apply one change notification.
    ///
    /// # Errors
    /// Propagates the failure of the primitive the event maps to.
    pub fn apply_event(&mut self, event: SyncEvent) -> SyncResult<EventOutcome> {
        if event.origin == Origin::Mirror {
            debug!("suppressing mirror-originated event {:?}", event.kind);
            return Ok(EventOutcome::Suppressed);
        }

        match event.kind {
            EventKind::GroupCreated { group } => {
                let Some(source) = self.stores.community.group_get(group).during("group.get")?
                else {
                    return Ok(EventOutcome::Skipped(SkipReason::NoCommunityGroup));
                };
                let pair = self.ensure_pair(&source)?;
                self.mirror_hierarchy(group, source.parent)?;
                Ok(EventOutcome::Pair(pair))
            }
            EventKind::GroupUpdated { group } => {
                let Some(source) = self.stores.community.group_get(group).during("group.get")?
                else {
                    return Ok(EventOutcome::Skipped(SkipReason::NoCommunityGroup));
                };
                self.update_pair(&source).map(EventOutcome::Pair)
            }
            EventKind::GroupDeleted { group } => {
                self.delete_pair(group).map(EventOutcome::PairDeleted)
            }
            EventKind::GroupReparented { group, parent } => {
                self.mirror_hierarchy(group, parent).map(EventOutcome::Hierarchy)
            }
            EventKind::MemberJoined { group, member, role } => {
                self.member_event(group, member, MembershipChange::add(role))
            }
            EventKind::MemberLeft { group, member, role } => {
                self.member_event(group, member, MembershipChange::remove(role))
            }
            EventKind::MemberPromoted { group, member } => {
                self.member_event(group, member, MembershipChange::promote())
            }
            EventKind::MemberDemoted { group, member } => {
                self.member_event(group, member, MembershipChange::demote())
            }
            EventKind::ContactAdded { group, contact } => {
                self.contact_event(group, contact, MemberAction::Add)
            }
            EventKind::ContactRemoved { group, contact } => {
                self.contact_event(group, contact, MemberAction::Remove)
            }
        }
    }

    fn member_event(
        &mut self,
        group: CommunityGroupId,
        member: CommunityMemberId,
        change: MembershipChange,
    ) -> SyncResult<EventOutcome> {
        let Some(source) = self.stores.community.group_get(group).during("group.get")? else {
            return Ok(EventOutcome::Skipped(SkipReason::NoCommunityGroup));
        };
        let pair = self.ensure_pair(&source)?;
        self.sync_membership(group, pair, member, change).map(outcome_of)
    }

    fn contact_event(
        &mut self,
        group: DirectoryGroupId,
        contact: ContactId,
        action: MemberAction,
    ) -> SyncResult<EventOutcome> {
        self.sync_contact(group, contact, action).map(outcome_of)
    }
}

fn outcome_of(outcome: SyncOutcome) -> EventOutcome {
    match outcome.skipped {
        Some(reason) => EventOutcome::Skipped(reason),
        None => EventOutcome::Membership(outcome),
    }
}
