use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use groupsync_core::{
    phase_label, BatchController, Collaborators, CommunityGroupId, CommunityMemberId,
    CommunityStore, ContactId, CursorState, Direction, DirectoryGroupId, EventOutcome,
    GroupPair, HierarchyOutcome, MemberAction, MembershipChange, Reconciler, RunReport,
    StepReport, SyncConfig, SyncEvent, SyncOutcome,
};
use groupsync_store_sqlite::{Fixture, FixtureSummary, PairInspection, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchStatus {
    pub batch_id: String,
    pub active: bool,
    pub phase_label: Option<String>,
    pub cursor: Option<CursorState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelResult {
    pub batch_id: String,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupSyncResult {
    pub group: CommunityGroupId,
    pub pair: GroupPair,
    pub hierarchy: HierarchyOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupDeleteResult {
    pub group: CommunityGroupId,
    pub deleted: Option<GroupPair>,
}

#[derive(Debug, Clone)]
pub struct GroupSyncApi {
    db_path: PathBuf,
    config: SyncConfig,
}

impl GroupSyncApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: SyncConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Seed Community and Directory records from a JSON fixture file.
    ///
    /// # Errors
    /// Returns an error when the fixture cannot be read or any row is rejected.
    pub fn load_fixture(&self, path: &Path) -> Result<FixtureSummary> {
        let fixture = Fixture::from_path(path)?;
        let mut store = self.open_migrated()?;
        let summary = store.load_fixture(&fixture)?;
        info!(
            "loaded fixture {}: groups={} members={} memberships={} contacts={}",
            path.display(),
            summary.groups,
            summary.members,
            summary.memberships,
            summary.contacts
        );
        Ok(summary)
    }

    /// Process one page of a resumable batch.
    ///
    /// # Errors
    /// Returns an error for invalid page sizes, a direction conflict with the stored
    /// cursor, or cursor persistence failures.
    pub fn batch_step(
        &self,
        batch_id: &str,
        direction: Direction,
        page_size: Option<u64>,
    ) -> Result<StepReport> {
        let store = self.open_migrated()?;
        let mut controller = self.controller(&store);
        Ok(controller.step(batch_id, direction, page_size)?)
    }

    /// Run both phases over the whole data set without persisting a cursor.
    ///
    /// # Errors
    /// Returns the first transient or read failure.
    pub fn batch_run(&self, batch_id: &str, direction: Direction) -> Result<RunReport> {
        let store = self.open_migrated()?;
        let mut controller = self.controller(&store);
        Ok(controller.run_unpaged(batch_id, direction)?)
    }

    /// # Errors
    /// Returns an error when the cursor store cannot be read.
    pub fn batch_status(&self, batch_id: &str) -> Result<BatchStatus> {
        let store = self.open_migrated()?;
        let cursor = self.controller(&store).status(batch_id)?;
        Ok(BatchStatus {
            batch_id: batch_id.to_string(),
            active: cursor.is_some(),
            phase_label: cursor.as_ref().map(|state| phase_label(state.direction, state.phase)),
            cursor,
        })
    }

    /// # Errors
    /// Returns an error when the cursor store cannot be updated.
    pub fn batch_cancel(&self, batch_id: &str) -> Result<CancelResult> {
        let store = self.open_migrated()?;
        let cancelled = self.controller(&store).cancel(batch_id)?;
        Ok(CancelResult { batch_id: batch_id.to_string(), cancelled })
    }

    /// Ensure the mirror pair of a Community group exists, push its fields and nest it.
    ///
    /// # Errors
    /// Returns an error when the group does not exist or any mirror write fails.
    pub fn sync_group(&self, group: CommunityGroupId) -> Result<GroupSyncResult> {
        let store = self.open_migrated()?;
        let source = store
            .group_get(group)
            .map_err(|err| anyhow!("failed to read community group {group}: {err}"))?
            .ok_or_else(|| anyhow!("community group {group} does not exist"))?;

        let mut run = self.reconciler(&store);
        run.ensure_pair(&source)?;
        let pair = run.update_pair(&source)?;
        let hierarchy = run.mirror_hierarchy(group, source.parent)?;
        Ok(GroupSyncResult { group, pair, hierarchy })
    }

    /// # Errors
    /// Returns an error when either mirror cannot be deleted.
    pub fn delete_group(&self, group: CommunityGroupId) -> Result<GroupDeleteResult> {
        let store = self.open_migrated()?;
        let deleted = self.reconciler(&store).delete_pair(group)?;
        Ok(GroupDeleteResult { group, deleted })
    }

    /// Mirror one Community membership change into the group's mirror pair.
    ///
    /// # Errors
    /// Returns an error when the group does not exist or a mirror write fails.
    pub fn sync_member(
        &self,
        group: CommunityGroupId,
        member: CommunityMemberId,
        change: MembershipChange,
    ) -> Result<SyncOutcome> {
        let store = self.open_migrated()?;
        let source = store
            .group_get(group)
            .map_err(|err| anyhow!("failed to read community group {group}: {err}"))?
            .ok_or_else(|| anyhow!("community group {group} does not exist"))?;

        let mut run = self.reconciler(&store);
        let pair = run.ensure_pair(&source)?;
        Ok(run.sync_membership(group, pair, member, change)?)
    }

    /// Apply a Directory-side contact change to the Community group it mirrors.
    ///
    /// # Errors
    /// Returns an error when a Community or Directory write fails.
    pub fn sync_contact(
        &self,
        group: DirectoryGroupId,
        contact: ContactId,
        action: MemberAction,
    ) -> Result<SyncOutcome> {
        let store = self.open_migrated()?;
        Ok(self.reconciler(&store).sync_contact(group, contact, action)?)
    }

    /// # Errors
    /// Returns an error when the parent pair cannot be created or an edge write fails.
    pub fn sync_hierarchy(
        &self,
        group: CommunityGroupId,
        parent: Option<CommunityGroupId>,
    ) -> Result<HierarchyOutcome> {
        let store = self.open_migrated()?;
        Ok(self.reconciler(&store).mirror_hierarchy(group, parent)?)
    }

    /// # Errors
    /// Returns an error when the operation the event maps to fails.
    pub fn apply_event(&self, event: SyncEvent) -> Result<EventOutcome> {
        let store = self.open_migrated()?;
        Ok(self.reconciler(&store).apply_event(event)?)
    }

    /// # Errors
    /// Returns an error when the pair or its mirrors cannot be read.
    pub fn inspect_pair(&self, group: CommunityGroupId) -> Result<Option<PairInspection>> {
        let store = self.open_migrated()?;
        store.inspect_pair(group)
    }

    fn reconciler<'a>(&'a self, store: &'a SqliteStore) -> Reconciler<'a> {
        Reconciler::new(Collaborators::from_store(store), &self.config)
    }

    fn controller<'a>(&'a self, store: &'a SqliteStore) -> BatchController<'a> {
        BatchController::new(self.reconciler(store), store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groupsync_core::{
        EventKind, MembershipStatus, Origin, Phase, Role, SkipReason, StepStatus,
    };

    fn unique_temp_path(extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("groupsync-api-{}.{extension}", ulid::Ulid::new()))
    }

    fn seeded_api() -> Result<(GroupSyncApi, PathBuf)> {
        let db_path = unique_temp_path("sqlite3");
        let fixture_path = unique_temp_path("json");
        let fixture = serde_json::json!({
            "groups": [
                {"id": 1, "title": "Club"},
                {"id": 2, "title": "Gardeners", "parent": 1}
            ],
            "members": [
                {"id": 10, "name": "Ada"},
                {"id": 11, "name": "Brook"},
                {"id": 12, "name": "Cy"}
            ],
            "memberships": [
                {"group": 2, "member": 10},
                {"group": 2, "member": 11},
                {"group": 2, "member": 12, "admin": true}
            ],
            "contacts": [
                {"id": 110, "member": 10},
                {"id": 111, "member": 11},
                {"id": 112, "member": 12}
            ]
        });
        std::fs::write(&fixture_path, serde_json::to_string_pretty(&fixture)?)?;

        let api = GroupSyncApi::new(db_path.clone(), SyncConfig::default());
        let summary = api.load_fixture(&fixture_path)?;
        assert_eq!(summary.memberships, 3);
        let _ = std::fs::remove_file(&fixture_path);
        Ok((api, db_path))
    }

    #[test]
    fn migrate_dry_run_plans_without_applying() -> Result<()> {
        let db_path = unique_temp_path("sqlite3");
        let api = GroupSyncApi::new(db_path.clone(), SyncConfig::default());

        let planned = api.migrate(true)?;
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn paged_batch_mirrors_fixture_and_clears_cursor() -> Result<()> {
        let (api, db_path) = seeded_api()?;

        let first = api.batch_step("nightly", Direction::CommunityToDirectory, Some(2))?;
        assert_eq!(first.status, StepStatus::Progressed);
        assert_eq!(api.batch_status("nightly")?.cursor.map(|state| state.offset), Some(2));

        let mut finished = first.finished;
        for _ in 0..10 {
            if finished {
                break;
            }
            let report = api.batch_step("nightly", Direction::CommunityToDirectory, Some(2))?;
            finished = report.finished;
        }
        assert!(finished);
        assert!(!api.batch_status("nightly")?.active);

        let Some(report) = api.inspect_pair(CommunityGroupId(2))? else {
            return Err(anyhow!("gardeners should be mirrored"));
        };
        let membership = report.membership.ok_or_else(|| anyhow!("membership mirror missing"))?;
        assert_eq!(membership.records.len(), 3);
        let access = report.access.ok_or_else(|| anyhow!("access mirror missing"))?;
        assert_eq!(access.records.len(), 1);
        assert_eq!(access.records[0].contact, ContactId(112));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn status_reports_phase_label_while_active() -> Result<()> {
        let (api, db_path) = seeded_api()?;

        api.batch_step("weekly", Direction::DirectoryToCommunity, Some(1))?;
        let status = api.batch_status("weekly")?;
        let cursor = status.cursor.ok_or_else(|| anyhow!("cursor should persist"))?;
        assert_eq!(cursor.phase, Phase::Remove);
        assert!(status.phase_label.is_some());

        assert!(api.batch_cancel("weekly")?.cancelled);
        assert!(!api.batch_cancel("weekly")?.cancelled);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn demotion_and_mirror_events_round_trip_through_the_store() -> Result<()> {
        let (api, db_path) = seeded_api()?;
        api.sync_group(CommunityGroupId(2))?;
        let (group, member) = (CommunityGroupId(2), CommunityMemberId(12));
        api.sync_member(group, member, MembershipChange::add(Role::Admin))?;

        let outcome = api.sync_member(group, member, MembershipChange::demote())?;
        assert!(!outcome.membership_changed);
        assert!(outcome.access_changed);

        let suppressed = api.apply_event(SyncEvent {
            origin: Origin::Mirror,
            kind: EventKind::MemberPromoted { group, member },
        })?;
        assert_eq!(suppressed, EventOutcome::Suppressed);

        let report = api
            .inspect_pair(CommunityGroupId(2))?
            .ok_or_else(|| anyhow!("pair should exist"))?;
        let access = report.access.ok_or_else(|| anyhow!("access mirror missing"))?;
        assert_eq!(access.records[0].status, MembershipStatus::Removed);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn hierarchy_for_unmirrored_group_is_skipped() -> Result<()> {
        let (api, db_path) = seeded_api()?;

        let outcome = api.sync_hierarchy(CommunityGroupId(2), Some(CommunityGroupId(1)))?;
        assert_eq!(outcome.skipped, Some(SkipReason::NoPair));

        let deleted = api.delete_group(CommunityGroupId(2))?;
        assert_eq!(deleted.deleted, None);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
