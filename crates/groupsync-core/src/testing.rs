//! In-memory collaborators with call recording and failure injection.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::StoreError;
use crate::model::{
    CommunityGroup, CommunityGroupId, CommunityMemberId, CommunityMembership, ContactId,
    DirectoryGroup, DirectoryGroupDraft, DirectoryGroupId, DirectoryGroupKind, GroupPair,
    MembershipRecord, MembershipStatus, Role,
};
use crate::stepper::CursorState;
use crate::traits::{
    AclLinker, CommunityStore, CorrespondenceStore, CursorStore, DirectoryStore, Lease, StoreResult,
};

/// Everything observable on the Directory side, for before/after comparisons.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DirectorySnapshot {
    groups: BTreeMap<DirectoryGroupId, DirectoryGroup>,
    memberships: Vec<MembershipRecord>,
    nesting: BTreeSet<(DirectoryGroupId, DirectoryGroupId)>,
    links: BTreeSet<(DirectoryGroupId, DirectoryGroupId)>,
}

#[derive(Default)]
struct Faults {
    ops: BTreeMap<&'static str, StoreError>,
    create_kinds: BTreeMap<DirectoryGroupKind, StoreError>,
    membership_groups: BTreeSet<DirectoryGroupId>,
}

#[derive(Default)]
pub struct FakeWorld {
    community_groups: RefCell<BTreeMap<CommunityGroupId, CommunityGroup>>,
    rosters: RefCell<BTreeMap<(CommunityGroupId, CommunityMemberId), bool>>,
    inactive: RefCell<BTreeSet<CommunityMemberId>>,
    contacts: RefCell<BTreeMap<CommunityMemberId, ContactId>>,
    directory_groups: RefCell<BTreeMap<DirectoryGroupId, DirectoryGroup>>,
    memberships: RefCell<Vec<MembershipRecord>>,
    nesting: RefCell<BTreeSet<(DirectoryGroupId, DirectoryGroupId)>>,
    links: RefCell<BTreeSet<(DirectoryGroupId, DirectoryGroupId)>>,
    mappings: RefCell<BTreeMap<CommunityGroupId, GroupPair>>,
    next_directory_id: Cell<u64>,
    calls: RefCell<Vec<&'static str>>,
    faults: RefCell<Faults>,
}

impl FakeWorld {
    pub fn add_group(&self, id: u64, title: &str, parent: Option<u64>) {
        self.community_groups.borrow_mut().insert(
            CommunityGroupId(id),
            CommunityGroup {
                id: CommunityGroupId(id),
                title: title.to_string(),
                description: format!("{title} description"),
                is_active: true,
                parent: parent.map(CommunityGroupId),
            },
        );
    }

    pub fn community_group(&self, id: u64) -> CommunityGroup {
        self.community_groups
            .borrow()
            .get(&CommunityGroupId(id))
            .cloned()
            .unwrap_or_else(|| panic!("community group {id} not seeded"))
    }

    pub fn rename_group(&self, id: u64, title: &str) {
        if let Some(group) = self.community_groups.borrow_mut().get_mut(&CommunityGroupId(id)) {
            group.title = title.to_string();
        }
    }

    /// Register a member account with its Directory contact.
    pub fn add_member(&self, member: u64, contact: u64) {
        self.contacts.borrow_mut().insert(CommunityMemberId(member), ContactId(contact));
    }

    pub fn deactivate(&self, member: u64) {
        self.inactive.borrow_mut().insert(CommunityMemberId(member));
    }

    pub fn join(&self, group: u64, member: u64, admin: bool) {
        let key = (CommunityGroupId(group), CommunityMemberId(member));
        self.rosters.borrow_mut().insert(key, admin);
    }

    pub fn leave(&self, group: u64, member: u64) {
        self.rosters.borrow_mut().remove(&(CommunityGroupId(group), CommunityMemberId(member)));
    }

    pub fn community_is_member(&self, group: u64, member: u64) -> bool {
        self.rosters.borrow().contains_key(&(CommunityGroupId(group), CommunityMemberId(member)))
    }

    pub fn community_is_admin(&self, group: u64, member: u64) -> bool {
        self.rosters
            .borrow()
            .get(&(CommunityGroupId(group), CommunityMemberId(member)))
            .copied()
            .unwrap_or(false)
    }

    pub fn directory_group(&self, id: DirectoryGroupId) -> DirectoryGroup {
        self.directory_groups
            .borrow()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| panic!("directory group {id} does not exist"))
    }

    pub fn directory_group_count(&self) -> usize {
        self.directory_groups.borrow().len()
    }

    /// Create a Directory group behind the engine's back.
    pub fn insert_directory_group(&self, draft: &DirectoryGroupDraft) -> DirectoryGroupId {
        let id = self.allocate_id();
        self.directory_groups.borrow_mut().insert(id, group_from_draft(id, draft));
        id
    }

    pub fn insert_membership(
        &self,
        group: DirectoryGroupId,
        contact: ContactId,
        status: MembershipStatus,
    ) {
        self.memberships.borrow_mut().push(MembershipRecord { group, contact, status });
    }

    pub fn is_linked(&self, access: DirectoryGroupId, membership: DirectoryGroupId) -> bool {
        self.links.borrow().contains(&(access, membership))
    }

    pub fn mapping(&self, group: CommunityGroupId) -> Option<GroupPair> {
        self.mappings.borrow().get(&group).copied()
    }

    pub fn clear_mappings(&self) {
        self.mappings.borrow_mut().clear();
    }

    pub fn present_contacts(&self, group: DirectoryGroupId) -> Vec<ContactId> {
        let mut contacts = self
            .memberships
            .borrow()
            .iter()
            .filter(|record| record.group == group && record.status.is_present())
            .map(|record| record.contact)
            .collect::<Vec<_>>();
        contacts.sort();
        contacts
    }

    pub fn status_of(
        &self,
        group: DirectoryGroupId,
        contact: ContactId,
    ) -> Option<MembershipStatus> {
        self.memberships
            .borrow()
            .iter()
            .find(|record| record.group == group && record.contact == contact)
            .map(|record| record.status)
    }

    pub fn record_count(&self, group: DirectoryGroupId, contact: ContactId) -> usize {
        self.memberships
            .borrow()
            .iter()
            .filter(|record| record.group == group && record.contact == contact)
            .count()
    }

    pub fn parents_of(&self, child: DirectoryGroupId) -> Vec<DirectoryGroupId> {
        self.nesting
            .borrow()
            .iter()
            .filter(|(edge_child, _)| *edge_child == child)
            .map(|(_, parent)| *parent)
            .collect()
    }

    pub fn directory_snapshot(&self) -> DirectorySnapshot {
        DirectorySnapshot {
            groups: self.directory_groups.borrow().clone(),
            memberships: self.memberships.borrow().clone(),
            nesting: self.nesting.borrow().clone(),
            links: self.links.borrow().clone(),
        }
    }

    pub fn count_calls(&self, op: &str) -> usize {
        self.calls.borrow().iter().filter(|call| **call == op).count()
    }

    pub fn reset_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    /// Make every call of `op` fail permanently.
    pub fn fail_op(&self, op: &'static str) {
        self.faults.borrow_mut().ops.insert(op, StoreError::Rejected(format!("{op} refused")));
    }

    /// Make every call of `op` fail as if the store were unreachable.
    pub fn fail_op_transient(&self, op: &'static str) {
        self.faults.borrow_mut().ops.insert(op, StoreError::Unavailable(format!("{op} timed out")));
    }

    pub fn fail_create_of(&self, kind: DirectoryGroupKind) {
        let err = StoreError::Rejected(format!("cannot create {} group", kind.as_str()));
        self.faults.borrow_mut().create_kinds.insert(kind, err);
    }

    pub fn fail_create_of_transient(&self, kind: DirectoryGroupKind) {
        let err = StoreError::Unavailable(format!("{} group create timed out", kind.as_str()));
        self.faults.borrow_mut().create_kinds.insert(kind, err);
    }

    /// Make record creation inside one Directory group fail.
    pub fn fail_create_in(&self, group: DirectoryGroupId) {
        self.faults.borrow_mut().membership_groups.insert(group);
    }

    pub fn clear_faults(&self) {
        *self.faults.borrow_mut() = Faults::default();
    }

    fn call(&self, op: &'static str) -> StoreResult<()> {
        self.calls.borrow_mut().push(op);
        match self.faults.borrow().ops.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn allocate_id(&self) -> DirectoryGroupId {
        let id = self.next_directory_id.get().max(500) + 1;
        self.next_directory_id.set(id);
        DirectoryGroupId(id)
    }

    fn record_index(&self, group: DirectoryGroupId, contact: ContactId) -> Option<usize> {
        self.memberships
            .borrow()
            .iter()
            .position(|record| record.group == group && record.contact == contact)
    }

    fn mirror_records(&self) -> Vec<MembershipRecord> {
        let groups = self.directory_groups.borrow();
        self.memberships
            .borrow()
            .iter()
            .filter(|record| {
                groups
                    .get(&record.group)
                    .is_some_and(|group| group.kind != DirectoryGroupKind::Container)
            })
            .copied()
            .collect()
    }
}

fn group_from_draft(id: DirectoryGroupId, draft: &DirectoryGroupDraft) -> DirectoryGroup {
    DirectoryGroup {
        id,
        title: draft.title.clone(),
        description: draft.description.clone(),
        source: Some(draft.source.clone()),
        kind: draft.kind,
        is_active: draft.is_active,
    }
}

fn window<T: Clone>(items: &[T], offset: u64, limit: u64) -> Vec<T> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX);
    let take = usize::try_from(limit).unwrap_or(usize::MAX);
    items.iter().skip(start).take(take).cloned().collect()
}

impl CommunityStore for FakeWorld {
    fn group_get(&self, group: CommunityGroupId) -> StoreResult<Option<CommunityGroup>> {
        self.call("group.get")?;
        Ok(self.community_groups.borrow().get(&group).cloned())
    }

    fn group_total_count(&self) -> StoreResult<u64> {
        self.call("group.total_count")?;
        Ok(self.community_groups.borrow().len() as u64)
    }

    fn is_member(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<bool> {
        self.call("member.is_member")?;
        Ok(self.rosters.borrow().contains_key(&(group, member)))
    }

    fn is_admin(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<bool> {
        self.call("member.is_admin")?;
        Ok(self.rosters.borrow().get(&(group, member)).copied().unwrap_or(false))
    }

    fn is_active(&self, member: CommunityMemberId) -> StoreResult<bool> {
        self.call("member.is_active")?;
        Ok(!self.inactive.borrow().contains(&member))
    }

    fn add_member(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<()> {
        self.call("member.add")?;
        self.rosters.borrow_mut().entry((group, member)).or_insert(false);
        Ok(())
    }

    fn remove_member(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<()> {
        self.call("member.remove")?;
        self.rosters.borrow_mut().remove(&(group, member));
        Ok(())
    }

    fn promote(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<()> {
        self.call("member.promote")?;
        self.rosters.borrow_mut().insert((group, member), true);
        Ok(())
    }

    fn demote(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<()> {
        self.call("member.demote")?;
        if let Some(admin) = self.rosters.borrow_mut().get_mut(&(group, member)) {
            *admin = false;
        }
        Ok(())
    }

    fn memberships_page(&self, offset: u64, limit: u64) -> StoreResult<Vec<CommunityMembership>> {
        self.call("membership.page")?;
        let rows = self
            .rosters
            .borrow()
            .iter()
            .map(|((group, member), admin)| CommunityMembership {
                group: *group,
                member: *member,
                role: Role::from_admin_flag(*admin),
            })
            .collect::<Vec<_>>();
        Ok(window(&rows, offset, limit))
    }

    fn membership_count(&self) -> StoreResult<u64> {
        self.call("membership.count")?;
        Ok(self.rosters.borrow().len() as u64)
    }
}

impl DirectoryStore for FakeWorld {
    fn group_create(&self, draft: &DirectoryGroupDraft) -> StoreResult<DirectoryGroupId> {
        self.call("group.create")?;
        if let Some(err) = self.faults.borrow().create_kinds.get(&draft.kind) {
            return Err(err.clone());
        }
        Ok(self.insert_directory_group(draft))
    }

    fn group_update(
        &self,
        group: DirectoryGroupId,
        draft: &DirectoryGroupDraft,
    ) -> StoreResult<()> {
        self.call("group.update")?;
        let mut groups = self.directory_groups.borrow_mut();
        let Some(existing) = groups.get_mut(&group) else {
            return Err(StoreError::Rejected(format!("directory group {group} does not exist")));
        };
        *existing = group_from_draft(group, draft);
        Ok(())
    }

    fn group_delete(&self, group: DirectoryGroupId) -> StoreResult<()> {
        self.call("group.delete")?;
        self.directory_groups.borrow_mut().remove(&group);
        self.memberships.borrow_mut().retain(|record| record.group != group);
        self.nesting.borrow_mut().retain(|(child, parent)| *child != group && *parent != group);
        Ok(())
    }

    fn group_get_by_id(&self, group: DirectoryGroupId) -> StoreResult<Option<DirectoryGroup>> {
        self.call("group.get_by_id")?;
        Ok(self.directory_groups.borrow().get(&group).cloned())
    }

    fn group_get_by_source(&self, source: &str) -> StoreResult<Vec<DirectoryGroup>> {
        self.call("group.get_by_source")?;
        Ok(self
            .directory_groups
            .borrow()
            .values()
            .filter(|group| group.source.as_deref() == Some(source))
            .cloned()
            .collect())
    }

    fn membership_get(
        &self,
        group: DirectoryGroupId,
        contact: ContactId,
    ) -> StoreResult<Option<MembershipRecord>> {
        self.call("membership.get")?;
        Ok(self
            .memberships
            .borrow()
            .iter()
            .find(|record| record.group == group && record.contact == contact)
            .copied())
    }

    fn membership_create(
        &self,
        group: DirectoryGroupId,
        contact: ContactId,
        status: MembershipStatus,
    ) -> StoreResult<()> {
        self.call("membership.create")?;
        if self.faults.borrow().membership_groups.contains(&group) {
            return Err(StoreError::Rejected(format!("cannot add records to group {group}")));
        }
        if self.record_index(group, contact).is_some() {
            return Err(StoreError::Rejected(format!("duplicate record for contact {contact}")));
        }
        self.insert_membership(group, contact, status);
        Ok(())
    }

    fn membership_set_status(
        &self,
        group: DirectoryGroupId,
        contact: ContactId,
        status: MembershipStatus,
    ) -> StoreResult<()> {
        self.call("membership.update")?;
        let Some(index) = self.record_index(group, contact) else {
            return Err(StoreError::Rejected(format!("no record for contact {contact}")));
        };
        self.memberships.borrow_mut()[index].status = status;
        Ok(())
    }

    fn mirror_memberships_page(
        &self,
        offset: u64,
        limit: u64,
    ) -> StoreResult<Vec<MembershipRecord>> {
        self.call("mirror_membership.page")?;
        Ok(window(&self.mirror_records(), offset, limit))
    }

    fn mirror_membership_count(&self) -> StoreResult<u64> {
        self.call("mirror_membership.count")?;
        Ok(self.mirror_records().len() as u64)
    }

    fn hierarchy_parents(&self, child: DirectoryGroupId) -> StoreResult<Vec<DirectoryGroupId>> {
        self.call("hierarchy.get")?;
        Ok(self.parents_of(child))
    }

    fn hierarchy_create(
        &self,
        child: DirectoryGroupId,
        parent: DirectoryGroupId,
    ) -> StoreResult<()> {
        self.call("hierarchy.create")?;
        self.nesting.borrow_mut().insert((child, parent));
        Ok(())
    }

    fn hierarchy_delete(
        &self,
        child: DirectoryGroupId,
        parent: DirectoryGroupId,
    ) -> StoreResult<()> {
        self.call("hierarchy.delete")?;
        self.nesting.borrow_mut().remove(&(child, parent));
        Ok(())
    }

    fn contact_id_by_member_id(&self, member: CommunityMemberId) -> StoreResult<Option<ContactId>> {
        self.call("contact.id_by_member_id")?;
        Ok(self.contacts.borrow().get(&member).copied())
    }

    fn member_id_by_contact_id(
        &self,
        contact: ContactId,
    ) -> StoreResult<Option<CommunityMemberId>> {
        self.call("contact.member_id")?;
        Ok(self
            .contacts
            .borrow()
            .iter()
            .find(|(_, known)| **known == contact)
            .map(|(member, _)| *member))
    }
}

impl AclLinker for FakeWorld {
    fn link(&self, access: DirectoryGroupId, membership: DirectoryGroupId) -> StoreResult<()> {
        self.call("acl.link")?;
        self.links.borrow_mut().insert((access, membership));
        Ok(())
    }

    fn unlink(&self, access: DirectoryGroupId, membership: DirectoryGroupId) -> StoreResult<()> {
        self.call("acl.unlink")?;
        self.links.borrow_mut().remove(&(access, membership));
        Ok(())
    }
}

impl CorrespondenceStore for FakeWorld {
    fn pair_get(&self, group: CommunityGroupId) -> StoreResult<Option<GroupPair>> {
        self.call("pair.get")?;
        Ok(self.mapping(group))
    }

    fn pair_put(&self, group: CommunityGroupId, pair: GroupPair) -> StoreResult<()> {
        self.call("pair.put")?;
        self.mappings.borrow_mut().insert(group, pair);
        Ok(())
    }

    fn pair_forget(&self, group: CommunityGroupId) -> StoreResult<()> {
        self.call("pair.forget")?;
        self.mappings.borrow_mut().remove(&group);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: RefCell<BTreeMap<String, CursorState>>,
    leases: RefCell<BTreeMap<String, String>>,
    saves: Cell<usize>,
    next_holder: Cell<u64>,
}

impl MemoryCursorStore {
    pub fn saved_count(&self) -> usize {
        self.saves.get()
    }
}

impl CursorStore for MemoryCursorStore {
    fn cursor_load(&self, batch_id: &str) -> StoreResult<Option<CursorState>> {
        Ok(self.cursors.borrow().get(batch_id).cloned())
    }

    fn cursor_save(&self, cursor: &CursorState) -> StoreResult<()> {
        self.saves.set(self.saves.get() + 1);
        self.cursors.borrow_mut().insert(cursor.batch_id.clone(), cursor.clone());
        Ok(())
    }

    fn cursor_delete(&self, batch_id: &str) -> StoreResult<()> {
        self.cursors.borrow_mut().remove(batch_id);
        Ok(())
    }

    fn try_acquire(&self, batch_id: &str, _stale_after_secs: u64) -> StoreResult<Option<Lease>> {
        let mut leases = self.leases.borrow_mut();
        if leases.contains_key(batch_id) {
            return Ok(None);
        }
        let holder = format!("holder-{}", self.next_holder.get());
        self.next_holder.set(self.next_holder.get() + 1);
        leases.insert(batch_id.to_string(), holder.clone());
        Ok(Some(Lease { batch_id: batch_id.to_string(), holder }))
    }

    fn release(&self, lease: &Lease) -> StoreResult<()> {
        let mut leases = self.leases.borrow_mut();
        if leases.get(&lease.batch_id) == Some(&lease.holder) {
            leases.remove(&lease.batch_id);
        }
        Ok(())
    }
}
