use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use groupsync_core::{
    AclLinker, CommunityGroup, CommunityGroupId, CommunityMemberId, CommunityMembership,
    CommunityStore, ContactId, CorrespondenceStore, CursorState, CursorStore, Direction,
    DirectoryGroup, DirectoryGroupDraft, DirectoryGroupId, DirectoryGroupKind, DirectoryStore,
    GroupPair, Lease, MembershipRecord, MembershipStatus, Phase, Role, StoreError, StoreResult,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS community_groups (
  group_id INTEGER PRIMARY KEY,
  title TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  parent_id INTEGER
);

CREATE TABLE IF NOT EXISTS community_members (
  member_id INTEGER PRIMARY KEY,
  display_name TEXT NOT NULL DEFAULT '',
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1))
);

CREATE TABLE IF NOT EXISTS community_memberships (
  group_id INTEGER NOT NULL,
  member_id INTEGER NOT NULL,
  is_admin INTEGER NOT NULL DEFAULT 0 CHECK (is_admin IN (0, 1)),
  PRIMARY KEY (group_id, member_id),
  FOREIGN KEY (group_id) REFERENCES community_groups(group_id) ON DELETE CASCADE,
  FOREIGN KEY (member_id) REFERENCES community_members(member_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS directory_groups (
  group_id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  source TEXT,
  group_kind TEXT NOT NULL CHECK (group_kind IN ('membership','access_control','container')),
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS directory_contacts (
  contact_id INTEGER PRIMARY KEY,
  member_id INTEGER UNIQUE,
  display_name TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS directory_memberships (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  group_id INTEGER NOT NULL,
  contact_id INTEGER NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('Added','Pending','Removed')),
  updated_at TEXT NOT NULL,
  UNIQUE(group_id, contact_id),
  FOREIGN KEY (group_id) REFERENCES directory_groups(group_id) ON DELETE CASCADE,
  FOREIGN KEY (contact_id) REFERENCES directory_contacts(contact_id)
);

CREATE TABLE IF NOT EXISTS directory_group_nesting (
  child_id INTEGER NOT NULL,
  parent_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY (child_id, parent_id),
  FOREIGN KEY (child_id) REFERENCES directory_groups(group_id) ON DELETE CASCADE,
  FOREIGN KEY (parent_id) REFERENCES directory_groups(group_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS acl_links (
  access_group_id INTEGER NOT NULL,
  membership_group_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY (access_group_id, membership_group_id),
  FOREIGN KEY (access_group_id) REFERENCES directory_groups(group_id) ON DELETE CASCADE,
  FOREIGN KEY (membership_group_id) REFERENCES directory_groups(group_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS group_pairs (
  community_group_id INTEGER PRIMARY KEY,
  membership_group_id INTEGER NOT NULL,
  access_group_id INTEGER NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batch_cursors (
  batch_id TEXT PRIMARY KEY,
  direction TEXT NOT NULL CHECK (direction IN ('community_to_directory','directory_to_community')),
  phase INTEGER NOT NULL CHECK (phase IN (0, 1, 2)),
  position INTEGER NOT NULL CHECK (position >= 0),
  page_size INTEGER NOT NULL CHECK (page_size >= 1),
  total INTEGER NOT NULL DEFAULT 0,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batch_leases (
  batch_id TEXT PRIMARY KEY,
  holder TEXT NOT NULL,
  acquired_at TEXT NOT NULL,
  acquired_unix INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_directory_groups_source ON directory_groups(source);
CREATE INDEX IF NOT EXISTS idx_directory_memberships_contact ON directory_memberships(contact_id);
CREATE INDEX IF NOT EXISTS idx_directory_group_nesting_parent ON directory_group_nesting(parent_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Seed data for both record stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Fixture {
    pub groups: Vec<FixtureGroup>,
    pub members: Vec<FixtureMember>,
    pub memberships: Vec<FixtureMembership>,
    pub contacts: Vec<FixtureContact>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixtureGroup {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub parent: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixtureMember {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixtureMembership {
    pub group: u64,
    pub member: u64,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixtureContact {
    pub id: u64,
    #[serde(default)]
    pub member: Option<u64>,
    #[serde(default)]
    pub name: String,
}

fn default_true() -> bool {
    true
}

impl Fixture {
    /// Read a JSON fixture file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or is not a valid fixture.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read fixture {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse fixture {}", path.display()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixtureSummary {
    pub groups: usize,
    pub members: usize,
    pub memberships: usize,
    pub contacts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MirrorInspection {
    pub group: DirectoryGroup,
    pub records: Vec<MembershipRecord>,
    pub parents: Vec<DirectoryGroupId>,
}

/// Read model of one Community group's mirror pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairInspection {
    pub community_group: CommunityGroupId,
    pub pair: GroupPair,
    pub linked: bool,
    pub membership: Option<MirrorInspection>,
    pub access: Option<MirrorInspection>,
}

impl SqliteStore {
    /// Open a SQLite-backed sync store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration_1()?;
            version = current_schema_version(&self.conn)?;
            info!("applied schema migration 1");
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        Ok(())
    }

    /// Upsert fixture rows into the Community and Directory tables.
    ///
    /// # Errors
    /// Returns an error when any row violates the schema; nothing is written then.
    pub fn load_fixture(&mut self, fixture: &Fixture) -> Result<FixtureSummary> {
        let tx = self.conn.transaction().context("failed to start fixture transaction")?;

        for group in &fixture.groups {
            tx.execute(
                "INSERT INTO community_groups(group_id, title, description, is_active, parent_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(group_id) DO UPDATE SET
                   title = excluded.title,
                   description = excluded.description,
                   is_active = excluded.is_active,
                   parent_id = excluded.parent_id",
                params![group.id, group.title, group.description, group.is_active, group.parent],
            )
            .with_context(|| format!("failed to load community group {}", group.id))?;
        }

        for member in &fixture.members {
            tx.execute(
                "INSERT INTO community_members(member_id, display_name, is_active)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(member_id) DO UPDATE SET
                   display_name = excluded.display_name,
                   is_active = excluded.is_active",
                params![member.id, member.name, member.is_active],
            )
            .with_context(|| format!("failed to load community member {}", member.id))?;
        }

        for membership in &fixture.memberships {
            tx.execute(
                "INSERT INTO community_memberships(group_id, member_id, is_admin)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(group_id, member_id) DO UPDATE SET is_admin = excluded.is_admin",
                params![membership.group, membership.member, membership.admin],
            )
            .with_context(|| {
                format!(
                    "failed to load membership of member {} in group {}",
                    membership.member, membership.group
                )
            })?;
        }

        for contact in &fixture.contacts {
            tx.execute(
                "INSERT INTO directory_contacts(contact_id, member_id, display_name)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(contact_id) DO UPDATE SET
                   member_id = excluded.member_id,
                   display_name = excluded.display_name",
                params![contact.id, contact.member, contact.name],
            )
            .with_context(|| format!("failed to load directory contact {}", contact.id))?;
        }

        tx.commit().context("failed to commit fixture transaction")?;
        Ok(FixtureSummary {
            groups: fixture.groups.len(),
            members: fixture.members.len(),
            memberships: fixture.memberships.len(),
            contacts: fixture.contacts.len(),
        })
    }

    /// Report the recorded mirror pair of a Community group with rosters and parent edges.
    ///
    /// # Errors
    /// Returns an error when any lookup fails.
    pub fn inspect_pair(&self, group: CommunityGroupId) -> Result<Option<PairInspection>> {
        let Some(pair) = self.pair_get(group).map_err(|err| anyhow!("{err}"))? else {
            return Ok(None);
        };
        let linked = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM acl_links
                   WHERE access_group_id = ?1 AND membership_group_id = ?2)",
                params![pair.access.0, pair.membership.0],
                |row| row.get::<_, bool>(0),
            )
            .context("failed to read acl link")?;

        Ok(Some(PairInspection {
            community_group: group,
            pair,
            linked,
            membership: self.inspect_mirror(pair.membership)?,
            access: self.inspect_mirror(pair.access)?,
        }))
    }

    fn inspect_mirror(&self, group: DirectoryGroupId) -> Result<Option<MirrorInspection>> {
        let Some(found) = self.group_get_by_id(group).map_err(|err| anyhow!("{err}"))? else {
            return Ok(None);
        };
        let mut stmt = self.conn.prepare(
            "SELECT group_id, contact_id, status FROM directory_memberships
             WHERE group_id = ?1
             ORDER BY contact_id ASC",
        )?;
        let records = stmt
            .query_map(params![group.0], membership_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read mirror roster")?;
        let parents = self.hierarchy_parents(group).map_err(|err| anyhow!("{err}"))?;
        Ok(Some(MirrorInspection { group: found, records, parents }))
    }
}

/// Map a SQLite failure onto the collaborator error taxonomy. Lock contention is
/// worth retrying; anything else is a refusal.
fn store_error(context: &str, err: &rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StoreError::Unavailable(format!("{context}: {err}"))
        }
        _ => StoreError::Rejected(format!("{context}: {err}")),
    }
}

trait SqlContext<T> {
    fn store_context(self, context: &str) -> StoreResult<T>;
}

impl<T> SqlContext<T> for rusqlite::Result<T> {
    fn store_context(self, context: &str) -> StoreResult<T> {
        self.map_err(|err| store_error(context, &err))
    }
}

fn stamp() -> StoreResult<String> {
    now_rfc3339().map_err(|err| StoreError::Rejected(format!("{err:#}")))
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(message),
    )
}

fn community_group_from_row(row: &Row<'_>) -> rusqlite::Result<CommunityGroup> {
    Ok(CommunityGroup {
        id: CommunityGroupId(row.get(0)?),
        title: row.get(1)?,
        description: row.get(2)?,
        is_active: row.get(3)?,
        parent: row.get::<_, Option<u64>>(4)?.map(CommunityGroupId),
    })
}

fn directory_group_from_row(row: &Row<'_>) -> rusqlite::Result<DirectoryGroup> {
    let kind_raw: String = row.get(4)?;
    let kind = DirectoryGroupKind::parse(&kind_raw)
        .ok_or_else(|| conversion_error(4, format!("unknown group_kind: {kind_raw}")))?;
    Ok(DirectoryGroup {
        id: DirectoryGroupId(row.get(0)?),
        title: row.get(1)?,
        description: row.get(2)?,
        source: row.get(3)?,
        kind,
        is_active: row.get(5)?,
    })
}

fn membership_from_row(row: &Row<'_>) -> rusqlite::Result<MembershipRecord> {
    let status_raw: String = row.get(2)?;
    let status = MembershipStatus::parse(&status_raw)
        .ok_or_else(|| conversion_error(2, format!("unknown membership status: {status_raw}")))?;
    Ok(MembershipRecord {
        group: DirectoryGroupId(row.get(0)?),
        contact: ContactId(row.get(1)?),
        status,
    })
}

fn cursor_from_row(row: &Row<'_>) -> rusqlite::Result<CursorState> {
    let direction_raw: String = row.get(1)?;
    let direction = Direction::parse(&direction_raw)
        .ok_or_else(|| conversion_error(1, format!("unknown direction: {direction_raw}")))?;
    let phase_code: u8 = row.get(2)?;
    let phase = Phase::from_code(phase_code)
        .ok_or_else(|| conversion_error(2, format!("unknown phase: {phase_code}")))?;
    Ok(CursorState {
        batch_id: row.get(0)?,
        direction,
        phase,
        offset: row.get(3)?,
        page_size: row.get(4)?,
        total: row.get(5)?,
    })
}

const DIRECTORY_GROUP_COLUMNS: &str = "group_id, title, description, source, group_kind, is_active";

impl CommunityStore for SqliteStore {
    fn group_get(&self, group: CommunityGroupId) -> StoreResult<Option<CommunityGroup>> {
        self.conn
            .query_row(
                "SELECT group_id, title, description, is_active, parent_id
                 FROM community_groups WHERE group_id = ?1",
                params![group.0],
                community_group_from_row,
            )
            .optional()
            .store_context("failed to read community group")
    }

    fn group_total_count(&self) -> StoreResult<u64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM community_groups", [], |row| row.get(0))
            .store_context("failed to count community groups")
    }

    fn is_member(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM community_memberships
                   WHERE group_id = ?1 AND member_id = ?2)",
                params![group.0, member.0],
                |row| row.get(0),
            )
            .store_context("failed to read community membership")
    }

    fn is_admin(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM community_memberships
                   WHERE group_id = ?1 AND member_id = ?2 AND is_admin = 1)",
                params![group.0, member.0],
                |row| row.get(0),
            )
            .store_context("failed to read community admin flag")
    }

    fn is_active(&self, member: CommunityMemberId) -> StoreResult<bool> {
        let active = self
            .conn
            .query_row(
                "SELECT is_active FROM community_members WHERE member_id = ?1",
                params![member.0],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .store_context("failed to read community member")?;
        Ok(active.unwrap_or(false))
    }

    fn add_member(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO community_memberships(group_id, member_id, is_admin)
                 VALUES (?1, ?2, 0)",
                params![group.0, member.0],
            )
            .store_context("failed to add community member")?;
        Ok(())
    }

    fn remove_member(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<()> {
        self.conn
            .execute(
                "DELETE FROM community_memberships WHERE group_id = ?1 AND member_id = ?2",
                params![group.0, member.0],
            )
            .store_context("failed to remove community member")?;
        Ok(())
    }

    fn promote(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<()> {
        self.set_admin(group, member, true)
    }

    fn demote(&self, group: CommunityGroupId, member: CommunityMemberId) -> StoreResult<()> {
        self.set_admin(group, member, false)
    }

    fn memberships_page(&self, offset: u64, limit: u64) -> StoreResult<Vec<CommunityMembership>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT group_id, member_id, is_admin FROM community_memberships
                 ORDER BY group_id ASC, member_id ASC
                 LIMIT ?1 OFFSET ?2",
            )
            .store_context("failed to prepare community membership page")?;
        let rows = stmt
            .query_map(params![limit, offset], |row| {
                Ok(CommunityMembership {
                    group: CommunityGroupId(row.get(0)?),
                    member: CommunityMemberId(row.get(1)?),
                    role: Role::from_admin_flag(row.get(2)?),
                })
            })
            .store_context("failed to read community membership page")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .store_context("failed to decode community membership page")
    }

    fn membership_count(&self) -> StoreResult<u64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM community_memberships", [], |row| row.get(0))
            .store_context("failed to count community memberships")
    }
}

impl SqliteStore {
    fn set_admin(
        &self,
        group: CommunityGroupId,
        member: CommunityMemberId,
        admin: bool,
    ) -> StoreResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE community_memberships SET is_admin = ?3
                 WHERE group_id = ?1 AND member_id = ?2",
                params![group.0, member.0, admin],
            )
            .store_context("failed to update community admin flag")?;
        if changed == 0 {
            return Err(StoreError::Rejected(format!(
                "member {member} is not in community group {group}"
            )));
        }
        Ok(())
    }
}

impl DirectoryStore for SqliteStore {
    fn group_create(&self, draft: &DirectoryGroupDraft) -> StoreResult<DirectoryGroupId> {
        let now = stamp()?;
        self.conn
            .execute(
                "INSERT INTO directory_groups(
                    title, description, source, group_kind, is_active, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    draft.title,
                    draft.description,
                    draft.source,
                    draft.kind.as_str(),
                    draft.is_active,
                    now
                ],
            )
            .store_context("failed to create directory group")?;
        let id = u64::try_from(self.conn.last_insert_rowid())
            .map_err(|err| StoreError::Rejected(format!("invalid directory group id: {err}")))?;
        Ok(DirectoryGroupId(id))
    }

    fn group_update(
        &self,
        group: DirectoryGroupId,
        draft: &DirectoryGroupDraft,
    ) -> StoreResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE directory_groups
                 SET title = ?2, description = ?3, source = ?4, is_active = ?5, updated_at = ?6
                 WHERE group_id = ?1",
                params![
                    group.0,
                    draft.title,
                    draft.description,
                    draft.source,
                    draft.is_active,
                    stamp()?
                ],
            )
            .store_context("failed to update directory group")?;
        if changed == 0 {
            return Err(StoreError::Rejected(format!("directory group {group} does not exist")));
        }
        Ok(())
    }

    fn group_delete(&self, group: DirectoryGroupId) -> StoreResult<()> {
        self.conn
            .execute("DELETE FROM directory_groups WHERE group_id = ?1", params![group.0])
            .store_context("failed to delete directory group")?;
        Ok(())
    }

    fn group_get_by_id(&self, group: DirectoryGroupId) -> StoreResult<Option<DirectoryGroup>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {DIRECTORY_GROUP_COLUMNS} FROM directory_groups WHERE group_id = ?1"
                ),
                params![group.0],
                directory_group_from_row,
            )
            .optional()
            .store_context("failed to read directory group")
    }

    fn group_get_by_source(&self, source: &str) -> StoreResult<Vec<DirectoryGroup>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {DIRECTORY_GROUP_COLUMNS} FROM directory_groups
                 WHERE source = ?1 ORDER BY group_id ASC"
            ))
            .store_context("failed to prepare source lookup")?;
        let rows = stmt
            .query_map(params![source], directory_group_from_row)
            .store_context("failed to look up directory groups by source")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .store_context("failed to decode directory groups")
    }

    fn membership_get(
        &self,
        group: DirectoryGroupId,
        contact: ContactId,
    ) -> StoreResult<Option<MembershipRecord>> {
        self.conn
            .query_row(
                "SELECT group_id, contact_id, status FROM directory_memberships
                 WHERE group_id = ?1 AND contact_id = ?2",
                params![group.0, contact.0],
                membership_from_row,
            )
            .optional()
            .store_context("failed to read directory membership")
    }

    fn membership_create(
        &self,
        group: DirectoryGroupId,
        contact: ContactId,
        status: MembershipStatus,
    ) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT INTO directory_memberships(group_id, contact_id, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![group.0, contact.0, status.as_str(), stamp()?],
            )
            .store_context("failed to create directory membership")?;
        Ok(())
    }

    fn membership_set_status(
        &self,
        group: DirectoryGroupId,
        contact: ContactId,
        status: MembershipStatus,
    ) -> StoreResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE directory_memberships SET status = ?3, updated_at = ?4
                 WHERE group_id = ?1 AND contact_id = ?2",
                params![group.0, contact.0, status.as_str(), stamp()?],
            )
            .store_context("failed to update directory membership")?;
        if changed == 0 {
            return Err(StoreError::Rejected(format!(
                "contact {contact} has no record in directory group {group}"
            )));
        }
        Ok(())
    }

    fn mirror_memberships_page(
        &self,
        offset: u64,
        limit: u64,
    ) -> StoreResult<Vec<MembershipRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT m.group_id, m.contact_id, m.status
                 FROM directory_memberships m
                 JOIN directory_groups g ON g.group_id = m.group_id
                 WHERE g.group_kind IN ('membership', 'access_control')
                 ORDER BY m.id ASC
                 LIMIT ?1 OFFSET ?2",
            )
            .store_context("failed to prepare mirror membership page")?;
        let rows = stmt
            .query_map(params![limit, offset], membership_from_row)
            .store_context("failed to read mirror membership page")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .store_context("failed to decode mirror membership page")
    }

    fn mirror_membership_count(&self) -> StoreResult<u64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM directory_memberships m
                 JOIN directory_groups g ON g.group_id = m.group_id
                 WHERE g.group_kind IN ('membership', 'access_control')",
                [],
                |row| row.get(0),
            )
            .store_context("failed to count mirror memberships")
    }

    fn hierarchy_parents(&self, child: DirectoryGroupId) -> StoreResult<Vec<DirectoryGroupId>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT parent_id FROM directory_group_nesting
                 WHERE child_id = ?1 ORDER BY parent_id ASC",
            )
            .store_context("failed to prepare parent lookup")?;
        let rows = stmt
            .query_map(params![child.0], |row| Ok(DirectoryGroupId(row.get(0)?)))
            .store_context("failed to read parent edges")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().store_context("failed to decode parent edges")
    }

    fn hierarchy_create(
        &self,
        child: DirectoryGroupId,
        parent: DirectoryGroupId,
    ) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO directory_group_nesting(child_id, parent_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![child.0, parent.0, stamp()?],
            )
            .store_context("failed to create parent edge")?;
        Ok(())
    }

    fn hierarchy_delete(
        &self,
        child: DirectoryGroupId,
        parent: DirectoryGroupId,
    ) -> StoreResult<()> {
        self.conn
            .execute(
                "DELETE FROM directory_group_nesting WHERE child_id = ?1 AND parent_id = ?2",
                params![child.0, parent.0],
            )
            .store_context("failed to delete parent edge")?;
        Ok(())
    }

    fn contact_id_by_member_id(&self, member: CommunityMemberId) -> StoreResult<Option<ContactId>> {
        self.conn
            .query_row(
                "SELECT contact_id FROM directory_contacts WHERE member_id = ?1",
                params![member.0],
                |row| Ok(ContactId(row.get(0)?)),
            )
            .optional()
            .store_context("failed to look up contact for member")
    }

    fn member_id_by_contact_id(
        &self,
        contact: ContactId,
    ) -> StoreResult<Option<CommunityMemberId>> {
        let member = self
            .conn
            .query_row(
                "SELECT member_id FROM directory_contacts WHERE contact_id = ?1",
                params![contact.0],
                |row| row.get::<_, Option<u64>>(0),
            )
            .optional()
            .store_context("failed to look up member for contact")?;
        Ok(member.flatten().map(CommunityMemberId))
    }
}

impl AclLinker for SqliteStore {
    fn link(&self, access: DirectoryGroupId, membership: DirectoryGroupId) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO acl_links(access_group_id, membership_group_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![access.0, membership.0, stamp()?],
            )
            .store_context("failed to link access mirror")?;
        Ok(())
    }

    fn unlink(&self, access: DirectoryGroupId, membership: DirectoryGroupId) -> StoreResult<()> {
        self.conn
            .execute(
                "DELETE FROM acl_links WHERE access_group_id = ?1 AND membership_group_id = ?2",
                params![access.0, membership.0],
            )
            .store_context("failed to unlink access mirror")?;
        Ok(())
    }
}

impl CorrespondenceStore for SqliteStore {
    fn pair_get(&self, group: CommunityGroupId) -> StoreResult<Option<GroupPair>> {
        self.conn
            .query_row(
                "SELECT membership_group_id, access_group_id FROM group_pairs
                 WHERE community_group_id = ?1",
                params![group.0],
                |row| {
                    Ok(GroupPair {
                        membership: DirectoryGroupId(row.get(0)?),
                        access: DirectoryGroupId(row.get(1)?),
                    })
                },
            )
            .optional()
            .store_context("failed to read group pair")
    }

    fn pair_put(&self, group: CommunityGroupId, pair: GroupPair) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT INTO group_pairs(
                   community_group_id, membership_group_id, access_group_id, updated_at
                 )
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(community_group_id) DO UPDATE SET
                   membership_group_id = excluded.membership_group_id,
                   access_group_id = excluded.access_group_id,
                   updated_at = excluded.updated_at",
                params![group.0, pair.membership.0, pair.access.0, stamp()?],
            )
            .store_context("failed to write group pair")?;
        Ok(())
    }

    fn pair_forget(&self, group: CommunityGroupId) -> StoreResult<()> {
        self.conn
            .execute("DELETE FROM group_pairs WHERE community_group_id = ?1", params![group.0])
            .store_context("failed to delete group pair")?;
        Ok(())
    }
}

impl CursorStore for SqliteStore {
    fn cursor_load(&self, batch_id: &str) -> StoreResult<Option<CursorState>> {
        self.conn
            .query_row(
                "SELECT batch_id, direction, phase, position, page_size, total
                 FROM batch_cursors WHERE batch_id = ?1",
                params![batch_id],
                cursor_from_row,
            )
            .optional()
            .store_context("failed to load batch cursor")
    }

    fn cursor_save(&self, cursor: &CursorState) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT INTO batch_cursors(
                   batch_id, direction, phase, position, page_size, total, updated_at
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(batch_id) DO UPDATE SET
                   direction = excluded.direction,
                   phase = excluded.phase,
                   position = excluded.position,
                   page_size = excluded.page_size,
                   total = excluded.total,
                   updated_at = excluded.updated_at",
                params![
                    cursor.batch_id,
                    cursor.direction.as_str(),
                    cursor.phase.code(),
                    cursor.offset,
                    cursor.page_size,
                    cursor.total,
                    stamp()?
                ],
            )
            .store_context("failed to save batch cursor")?;
        Ok(())
    }

    fn cursor_delete(&self, batch_id: &str) -> StoreResult<()> {
        self.conn
            .execute("DELETE FROM batch_cursors WHERE batch_id = ?1", params![batch_id])
            .store_context("failed to delete batch cursor")?;
        Ok(())
    }

    fn try_acquire(&self, batch_id: &str, stale_after_secs: u64) -> StoreResult<Option<Lease>> {
        let now = OffsetDateTime::now_utc();
        let stale_after = i64::try_from(stale_after_secs).unwrap_or(i64::MAX);
        let cutoff = now.unix_timestamp().saturating_sub(stale_after);
        let holder = Ulid::new().to_string();

        let taken_over = self
            .conn
            .query_row(
                "SELECT holder FROM batch_leases WHERE batch_id = ?1 AND acquired_unix <= ?2",
                params![batch_id, cutoff],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .store_context("failed to read batch lease")?;

        let changed = self
            .conn
            .execute(
                "INSERT INTO batch_leases(batch_id, holder, acquired_at, acquired_unix)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(batch_id) DO UPDATE SET
                   holder = excluded.holder,
                   acquired_at = excluded.acquired_at,
                   acquired_unix = excluded.acquired_unix
                 WHERE batch_leases.acquired_unix <= ?5",
                params![batch_id, holder, stamp()?, now.unix_timestamp(), cutoff],
            )
            .store_context("failed to acquire batch lease")?;
        if changed == 0 {
            return Ok(None);
        }
        if let Some(previous) = taken_over {
            warn!("took over stale lease on batch {batch_id} from holder {previous}");
        }
        Ok(Some(Lease { batch_id: batch_id.to_string(), holder }))
    }

    fn release(&self, lease: &Lease) -> StoreResult<()> {
        self.conn
            .execute(
                "DELETE FROM batch_leases WHERE batch_id = ?1 AND holder = ?2",
                params![lease.batch_id, lease.holder],
            )
            .store_context("failed to release batch lease")?;
        Ok(())
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
