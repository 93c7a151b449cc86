//! Creation, update and deletion of the two Directory mirrors of a Community group.

use tracing::{error, info, warn};

use crate::cache::Lookup;
use crate::error::{StoreError, StoreResultExt, SyncError, SyncResult};
use crate::model::{
    CommunityGroup, CommunityGroupId, DirectoryGroup, DirectoryGroupDraft, DirectoryGroupId,
    DirectoryGroupKind, GroupPair, MirrorKind,
};
use crate::reconciler::Reconciler;

/// What the Directory currently holds for one Community group.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Located {
    Pair(GroupPair),
    Partial { membership: Option<DirectoryGroupId>, access: Option<DirectoryGroupId> },
    Absent,
}

impl Reconciler<'_> {
    /// Existing mirror pair for `group`, without creating anything.
    ///
    /// Resolution order is the run cache, the correspondence table, then the source
    /// tags. A pair found only through its tags is linked again and written back to
    /// the correspondence table.
    ///
    /// # Errors
    /// Returns [`SyncError::Ambiguous`] when a source tag matches several groups, and
    /// propagates collaborator failures.
    pub fn resolve_pair(&mut self, group: CommunityGroupId) -> SyncResult<Option<GroupPair>> {
        match self.locate_pair(group)? {
            Located::Pair(pair) => Ok(Some(pair)),
            Located::Partial { .. } | Located::Absent => Ok(None),
        }
    }

    /// Mirror pair for `source`, creating whichever halves are missing.
    ///
    /// # Errors
    /// - [`SyncError::PartialMirror`] when the access mirror cannot be created (the
    ///   membership mirror created in the same call is deleted again).
    /// - [`SyncError::OrphanedMirror`] when that compensating delete fails too.
    /// - [`SyncError::AclLinkage`] when linkage fails; both mirrors are left in place.
    pub fn ensure_pair(&mut self, source: &CommunityGroup) -> SyncResult<GroupPair> {
        self.ensure_pair_tracked(source).map(|(pair, _)| pair)
    }

    /// Like [`Reconciler::ensure_pair`], also reporting whether anything was created.
    pub(crate) fn ensure_pair_tracked(
        &mut self,
        source: &CommunityGroup,
    ) -> SyncResult<(GroupPair, bool)> {
        match self.locate_pair(source.id)? {
            Located::Pair(pair) => Ok((pair, false)),
            Located::Absent => self.create_pair(source, None, None).map(|pair| (pair, true)),
            Located::Partial { membership, access } => {
                let group = source.id;
                warn!("community group {group} has only one mirror; creating the missing half");
                self.create_pair(source, membership, access).map(|pair| (pair, true))
            }
        }
    }

    /// Push title, description and active flag to both mirrors. An unmirrored group
    /// gets its pair created instead.
    ///
    /// # Errors
    /// Same failures as [`Reconciler::ensure_pair`], plus collaborator update failures.
    pub fn update_pair(&mut self, source: &CommunityGroup) -> SyncResult<GroupPair> {
        let (pair, created) = self.ensure_pair_tracked(source)?;
        if created {
            return Ok(pair);
        }
        for kind in [MirrorKind::Membership, MirrorKind::AccessControl] {
            let draft = self.mirror_draft(source, kind);
            self.stores.directory.group_update(pair.group(kind), &draft).during("group.update")?;
        }
        info!("updated mirror pair for community group {}", source.id);
        Ok(pair)
    }

    /// Remove both mirrors of a Community group that no longer exists.
    ///
    /// # Errors
    /// Returns [`SyncError::AclLinkage`] when unlinking fails, and propagates
    /// collaborator failures from the deletes.
    pub fn delete_pair(&mut self, group: CommunityGroupId) -> SyncResult<Option<GroupPair>> {
        let Some(pair) = self.resolve_pair(group)? else {
            return Ok(None);
        };
        self.stores.acl.unlink(pair.access, pair.membership).map_err(|err| {
            let access = pair.access;
            error!("failed to unlink access mirror {access} for community group {group}: {err}");
            SyncError::AclLinkage { group, message: err.to_string() }
        })?;
        self.stores.directory.group_delete(pair.access).during("group.delete")?;
        self.stores.directory.group_delete(pair.membership).during("group.delete")?;
        self.stores.correspondence.pair_forget(group).during("pair.forget")?;
        self.cache.forget_pair(group);
        info!("deleted mirror pair for community group {group}");
        Ok(Some(pair))
    }

    /// Well-known top-level group that parentless mirrors nest under, created on first use.
    ///
    /// # Errors
    /// Returns [`SyncError::Ambiguous`] when several groups carry the container tag.
    pub fn resolve_container(&mut self) -> SyncResult<Option<DirectoryGroupId>> {
        if !self.config.container.enabled {
            return Ok(None);
        }
        if let Some(container) = self.cache.container() {
            return Ok(Some(container));
        }
        let source = self.config.container.source.clone();
        let container = match self.find_unique_by_source(&source)? {
            Some(found) => found.id,
            None => {
                let draft = DirectoryGroupDraft {
                    title: self.config.container.title.clone(),
                    description: String::new(),
                    source,
                    kind: DirectoryGroupKind::Container,
                    is_active: true,
                };
                let id = self.stores.directory.group_create(&draft).during("group.create")?;
                info!("created container group {id}");
                id
            }
        };
        self.cache.store_container(container);
        Ok(Some(container))
    }

    pub(crate) fn mirror_draft(
        &self,
        source: &CommunityGroup,
        kind: MirrorKind,
    ) -> DirectoryGroupDraft {
        let title = match kind {
            MirrorKind::Membership => source.title.clone(),
            MirrorKind::AccessControl => self.config.access_title(&source.title),
        };
        DirectoryGroupDraft {
            title,
            description: source.description.clone(),
            source: self.config.source_tag(kind, source.id),
            kind: kind.into(),
            is_active: source.is_active,
        }
    }

    fn locate_pair(&mut self, group: CommunityGroupId) -> SyncResult<Located> {
        match self.cache.lookup_pair(group) {
            Lookup::Hit(pair) => return Ok(Located::Pair(pair)),
            Lookup::KnownAbsent => return Ok(Located::Absent),
            Lookup::Miss => {}
        }

        if let Some(pair) = self.stores.correspondence.pair_get(group).during("pair.get")? {
            if self.mirror_exists(pair.membership)? && self.mirror_exists(pair.access)? {
                self.cache.store_pair(group, Some(pair));
                return Ok(Located::Pair(pair));
            }
            warn!("discarding stale correspondence row for community group {group}");
            self.stores.correspondence.pair_forget(group).during("pair.forget")?;
        }

        let membership = self
            .find_unique_by_source(&self.config.source_tag(MirrorKind::Membership, group))?
            .map(|found| found.id);
        let access = self
            .find_unique_by_source(&self.config.source_tag(MirrorKind::AccessControl, group))?
            .map(|found| found.id);

        match (membership, access) {
            (Some(membership), Some(access)) => {
                let pair = GroupPair { membership, access };
                self.link(group, pair)?;
                self.stores.correspondence.pair_put(group, pair).during("pair.put")?;
                info!("recovered mirror pair for community group {group} from source tags");
                self.cache.store_pair(group, Some(pair));
                Ok(Located::Pair(pair))
            }
            (None, None) => {
                self.cache.store_pair(group, None);
                Ok(Located::Absent)
            }
            (membership, access) => Ok(Located::Partial { membership, access }),
        }
    }

    fn create_pair(
        &mut self,
        source: &CommunityGroup,
        existing_membership: Option<DirectoryGroupId>,
        existing_access: Option<DirectoryGroupId>,
    ) -> SyncResult<GroupPair> {
        let membership = match existing_membership {
            Some(id) => id,
            None => {
                let draft = self.mirror_draft(source, MirrorKind::Membership);
                self.stores.directory.group_create(&draft).during("group.create")?
            }
        };

        let access = match existing_access {
            Some(id) => id,
            None => {
                let draft = self.mirror_draft(source, MirrorKind::AccessControl);
                match self.stores.directory.group_create(&draft) {
                    Ok(id) => id,
                    Err(create_err) => {
                        if existing_membership.is_none() {
                            self.compensate(source.id, membership)?;
                        }
                        error!(
                            "failed to create access mirror for community group {}: {create_err}",
                            source.id
                        );
                        if matches!(create_err, StoreError::Unavailable(_)) {
                            return Err(SyncError::from_store("group.create", create_err));
                        }
                        return Err(SyncError::PartialMirror {
                            group: source.id,
                            message: create_err.to_string(),
                        });
                    }
                }
            }
        };

        let pair = GroupPair { membership, access };
        self.link(source.id, pair)?;
        self.stores.correspondence.pair_put(source.id, pair).during("pair.put")?;
        self.cache.store_pair(source.id, Some(pair));
        info!(
            "created mirror pair for community group {}: membership={} access={}",
            source.id, pair.membership, pair.access
        );
        Ok(pair)
    }

    fn compensate(&self, group: CommunityGroupId, membership: DirectoryGroupId) -> SyncResult<()> {
        if let Err(delete_err) = self.stores.directory.group_delete(membership) {
            error!(
                "orphaned membership mirror {membership} for community group {group}: {delete_err}"
            );
            return Err(SyncError::OrphanedMirror { group, mirror: membership });
        }
        Ok(())
    }

    fn link(&self, group: CommunityGroupId, pair: GroupPair) -> SyncResult<()> {
        self.stores.acl.link(pair.access, pair.membership).map_err(|err| {
            error!("access-control linkage failed for community group {group}: {err}");
            SyncError::AclLinkage { group, message: err.to_string() }
        })
    }

    fn mirror_exists(&self, group: DirectoryGroupId) -> SyncResult<bool> {
        Ok(self.stores.directory.group_get_by_id(group).during("group.get_by_id")?.is_some())
    }

    fn find_unique_by_source(&self, source: &str) -> SyncResult<Option<DirectoryGroup>> {
        let mut found =
            self.stores.directory.group_get_by_source(source).during("group.get_by_source")?;
        if found.len() > 1 {
            let ids = found.iter().map(|group| group.id.to_string()).collect::<Vec<_>>();
            error!("source tag {source:?} matches groups {}", ids.join(","));
            return Err(SyncError::Ambiguous(format!(
                "source tag {source:?} matches {} groups ({})",
                found.len(),
                ids.join(",")
            )));
        }
        Ok(found.pop())
    }
}
