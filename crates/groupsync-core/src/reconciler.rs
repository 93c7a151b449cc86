use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CorrespondenceCache, Lookup};
use crate::config::SyncConfig;
use crate::error::{StoreResultExt, SyncResult};
use crate::model::{CommunityGroupId, CommunityMemberId, ContactId, DirectoryGroupId, MirrorKind};
use crate::traits::{AclLinker, CommunityStore, CorrespondenceStore, DirectoryStore};

/// Borrowed handles to every record store the engine talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub community: &'a dyn CommunityStore,
    pub directory: &'a dyn DirectoryStore,
    pub acl: &'a dyn AclLinker,
    pub correspondence: &'a dyn CorrespondenceStore,
}

impl<'a> Collaborators<'a> {
    /// Use one backend that implements every collaborator interface.
    pub fn from_store<S>(store: &'a S) -> Self
    where
        S: CommunityStore + DirectoryStore + AclLinker + CorrespondenceStore,
    {
        Self { community: store, directory: store, acl: store, correspondence: store }
    }
}

/// Why an operation had nothing to do. Skips are counted, never treated as failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The Community member has no Directory contact.
    NoContact,
    /// The Directory contact has no Community member.
    NoMember,
    /// The Community group has no mirror pair.
    NoPair,
    /// The Directory group is not a mirror created by this engine.
    NotMirrorGroup,
    /// The Community group no longer exists.
    NoCommunityGroup,
}

/// One reconciliation run: the collaborators plus a cache scoped to this run.
pub struct Reconciler<'a> {
    pub(crate) stores: Collaborators<'a>,
    pub(crate) config: &'a SyncConfig,
    pub(crate) cache: CorrespondenceCache,
}

impl<'a> Reconciler<'a> {
    #[must_use]
    pub fn new(stores: Collaborators<'a>, config: &'a SyncConfig) -> Self {
        Self { stores, config, cache: CorrespondenceCache::new() }
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        self.config
    }

    #[must_use]
    pub fn cache(&self) -> &CorrespondenceCache {
        &self.cache
    }

    /// Directory contact for a Community member, if one exists.
    ///
    /// # Errors
    /// Propagates collaborator failures from the contact lookup.
    pub fn resolve_contact(&mut self, member: CommunityMemberId) -> SyncResult<Option<ContactId>> {
        match self.cache.lookup_contact(member) {
            Lookup::Hit(contact) => return Ok(Some(contact)),
            Lookup::KnownAbsent => return Ok(None),
            Lookup::Miss => {}
        }
        let contact = self
            .stores
            .directory
            .contact_id_by_member_id(member)
            .during("contact.id_by_member_id")?;
        if contact.is_none() {
            debug!("community member {member} has no directory contact");
        }
        self.cache.store_contact(member, contact);
        Ok(contact)
    }

    /// Community member for a Directory contact, if one exists.
    ///
    /// # Errors
    /// Propagates collaborator failures from the member lookup.
    pub fn resolve_member(&mut self, contact: ContactId) -> SyncResult<Option<CommunityMemberId>> {
        match self.cache.lookup_member(contact) {
            Lookup::Hit(member) => return Ok(Some(member)),
            Lookup::KnownAbsent => return Ok(None),
            Lookup::Miss => {}
        }
        let member =
            self.stores.directory.member_id_by_contact_id(contact).during("contact.member_id")?;
        if member.is_none() {
            debug!("directory contact {contact} has no community member");
        }
        self.cache.store_member(contact, member);
        Ok(member)
    }

    /// Community group and mirror kind a Directory group was created for, read from
    /// its source tag.
    ///
    /// # Errors
    /// Propagates collaborator failures from the group lookup.
    pub fn resolve_mirror(
        &mut self,
        group: DirectoryGroupId,
    ) -> SyncResult<Option<(CommunityGroupId, MirrorKind)>> {
        match self.cache.lookup_mirror(group) {
            Lookup::Hit(source) => return Ok(Some(source)),
            Lookup::KnownAbsent => return Ok(None),
            Lookup::Miss => {}
        }
        let source = self
            .stores
            .directory
            .group_get_by_id(group)
            .during("group.get_by_id")?
            .and_then(|found| found.source)
            .and_then(|tag| self.config.parse_source_tag(&tag));
        self.cache.store_mirror(group, source);
        Ok(source)
    }
}
