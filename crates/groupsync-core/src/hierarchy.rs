//! Single-parent nesting of mirror groups.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StoreResultExt, SyncResult};
use crate::model::{CommunityGroupId, DirectoryGroupId, MirrorKind};
use crate::reconciler::{Reconciler, SkipReason};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct HierarchyOutcome {
    pub edges_removed: u64,
    pub edges_created: u64,
    pub skipped: Option<SkipReason>,
}

impl Reconciler<'_> {
    /// Re-nest both mirrors of `group` under the mirrors of `new_parent`, or under the
    /// container group when it has no parent.
    ///
    /// Each mirror ends with exactly one parent edge. Existing edges are always
    /// deleted before the new one is created; a failure in between leaves the mirror
    /// parentless until the next run, never with two parents.
    ///
    /// # Errors
    /// Propagates collaborator failures and pair-creation failures for the parent.
    pub fn mirror_hierarchy(
        &mut self,
        group: CommunityGroupId,
        new_parent: Option<CommunityGroupId>,
    ) -> SyncResult<HierarchyOutcome> {
        let Some(pair) = self.resolve_pair(group)? else {
            debug!("community group {group} has no mirror pair; hierarchy not mirrored");
            return Ok(HierarchyOutcome {
                skipped: Some(SkipReason::NoPair),
                ..HierarchyOutcome::default()
            });
        };

        let parent_pair = match new_parent {
            Some(parent) => match self.resolve_pair(parent)? {
                Some(found) => Some(found),
                None => match self.stores.community.group_get(parent).during("group.get")? {
                    Some(parent_group) => Some(self.ensure_pair(&parent_group)?),
                    None => {
                        return Ok(HierarchyOutcome {
                            skipped: Some(SkipReason::NoCommunityGroup),
                            ..HierarchyOutcome::default()
                        });
                    }
                },
            },
            None => None,
        };
        let container = match parent_pair {
            Some(_) => None,
            None => self.resolve_container()?,
        };

        let mut outcome = HierarchyOutcome::default();
        for kind in [MirrorKind::Membership, MirrorKind::AccessControl] {
            let target = parent_pair.map(|found| found.group(kind)).or(container);
            let child = pair.group(kind);
            outcome.edges_removed += self.clear_parents(child)?;
            if let Some(parent) = target {
                self.stores.directory.hierarchy_create(child, parent).during("hierarchy.create")?;
                outcome.edges_created += 1;
            }
        }

        info!(
            "mirrored hierarchy for community group {group}: removed={} created={}",
            outcome.edges_removed, outcome.edges_created
        );
        Ok(outcome)
    }

    fn clear_parents(&self, child: DirectoryGroupId) -> SyncResult<u64> {
        let directory = self.stores.directory;
        let parents = directory.hierarchy_parents(child).during("hierarchy.get")?;
        for parent in &parents {
            directory.hierarchy_delete(child, *parent).during("hierarchy.delete")?;
        }
        Ok(parents.len() as u64)
    }
}
