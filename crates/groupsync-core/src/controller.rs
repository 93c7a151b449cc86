//! Two-phase batch reconciliation, one page per invocation.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{StoreError, StoreResultExt, SyncError, SyncResult};
use crate::membership::{MembershipChange, SyncOutcome};
use crate::model::{
    CommunityMembership, Direction, MemberAction, MembershipRecord, MembershipStatus,
};
use crate::reconciler::{Reconciler, SkipReason};
use crate::stepper::{CursorState, Phase, Stepper};
use crate::traits::{CursorStore, Lease};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// A page was applied and the cursor moved.
    Progressed,
    /// The last page was applied and the cursor was deleted.
    Finished,
    /// Nothing was committed; invoke again with the same identifier.
    Retry,
    /// Another invocation holds the batch.
    Busy,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PageTally {
    pub processed: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Records that disappeared from the listing being paged over.
    pub vanished: u64,
}

impl PageTally {
    fn record(&mut self, outcome: SyncOutcome) {
        self.processed += 1;
        if outcome.skipped.is_some() {
            self.skipped += 1;
        } else if outcome.is_noop() {
            self.unchanged += 1;
        } else {
            self.changed += 1;
        }
    }

    fn absorb(&mut self, other: PageTally) {
        self.processed += other.processed;
        self.changed += other.changed;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.vanished += other.vanished;
    }
}

/// What one invocation did. `range_from..range_to` is the item window applied,
/// for "processing items N..M" progress messages.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StepReport {
    pub batch_id: String,
    pub direction: Direction,
    pub status: StepStatus,
    pub finished: bool,
    pub phase: Phase,
    pub phase_label: String,
    pub range_from: u64,
    pub range_to: u64,
    pub total: u64,
    pub tally: PageTally,
    pub message: Option<String>,
}

impl StepReport {
    fn idle(batch_id: &str, direction: Direction, status: StepStatus, message: String) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            direction,
            status,
            finished: false,
            phase: Phase::Populate,
            phase_label: phase_label(direction, Phase::Populate),
            range_from: 0,
            range_to: 0,
            total: 0,
            tally: PageTally::default(),
            message: Some(message),
        }
    }
}

/// Totals of an unpaged run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunReport {
    pub batch_id: String,
    pub direction: Direction,
    pub status: StepStatus,
    pub pages: u64,
    pub tally: PageTally,
}

#[must_use]
pub fn phase_label(direction: Direction, phase: Phase) -> String {
    let subject = match (direction, phase) {
        (_, Phase::Done) => return "done".to_string(),
        (Direction::CommunityToDirectory, Phase::Populate) => "community memberships",
        (Direction::CommunityToDirectory, Phase::Remove) => "stale directory memberships",
        (Direction::DirectoryToCommunity, Phase::Populate) => "directory memberships",
        (Direction::DirectoryToCommunity, Phase::Remove) => "stale community memberships",
    };
    match phase {
        Phase::Populate => format!("populating from {subject}"),
        _ => format!("removing {subject}"),
    }
}

/// One page of whichever listing the current phase walks.
enum Page {
    Community(Vec<CommunityMembership>),
    Directory(Vec<MembershipRecord>),
}

impl Page {
    fn len(&self) -> usize {
        match self {
            Self::Community(items) => items.len(),
            Self::Directory(items) => items.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct BatchController<'a> {
    reconciler: Reconciler<'a>,
    cursors: &'a dyn CursorStore,
}

fn cursor_error(err: &StoreError) -> SyncError {
    SyncError::CursorStore(err.to_string())
}

/// Why a page stopped before its cursor was saved.
enum Interrupted {
    /// The listing itself could not be read.
    Read(SyncError),
    Failed(SyncError),
}

impl From<SyncError> for Interrupted {
    fn from(err: SyncError) -> Self {
        Self::Failed(err)
    }
}

impl Interrupted {
    /// The error to report in a retry, or the hard error to return.
    fn into_retryable(self) -> Result<SyncError, SyncError> {
        match self {
            Self::Read(err) => Ok(err),
            Self::Failed(err) if err.is_transient() => Ok(err),
            Self::Failed(err) => Err(err),
        }
    }

    fn into_error(self) -> SyncError {
        match self {
            Self::Read(err) | Self::Failed(err) => err,
        }
    }
}

impl<'a> BatchController<'a> {
    #[must_use]
    pub fn new(reconciler: Reconciler<'a>, cursors: &'a dyn CursorStore) -> Self {
        Self { reconciler, cursors }
    }

    #[must_use]
    pub fn reconciler(&self) -> &Reconciler<'a> {
        &self.reconciler
    }

    /// Process exactly one page of the batch named `batch_id`.
    ///
    /// Any failure to read the listing, or a transient failure on any item, yields
    /// a [`StepStatus::Retry`] report and leaves the cursor where it was.
    ///
    /// # Errors
    /// - [`SyncError::Validation`] for a zero page size; unpaged work goes through
    ///   [`BatchController::run_unpaged`].
    /// - [`SyncError::Conflict`] when the stored cursor runs in the other direction.
    /// - [`SyncError::CursorStore`] when the cursor cannot be persisted.
    pub fn step(
        &mut self,
        batch_id: &str,
        direction: Direction,
        page_size: Option<u64>,
    ) -> SyncResult<StepReport> {
        if page_size == Some(0) {
            return Err(SyncError::Validation(
                "page size 0 means unpaged and is only accepted by scheduled runs".to_string(),
            ));
        }
        let Some(lease) = self.acquire(batch_id)? else {
            return Ok(StepReport::idle(
                batch_id,
                direction,
                StepStatus::Busy,
                format!("batch {batch_id} is held by another invocation"),
            ));
        };
        let result = self.step_locked(batch_id, direction, page_size);
        self.release(&lease);
        result
    }

    /// Process both phases over the whole data set in one call, with a cursor that
    /// is never persisted.
    ///
    /// # Errors
    /// Returns the first transient or read failure; nothing is resumable.
    pub fn run_unpaged(&mut self, batch_id: &str, direction: Direction) -> SyncResult<RunReport> {
        let Some(lease) = self.acquire(batch_id)? else {
            return Ok(RunReport {
                batch_id: batch_id.to_string(),
                direction,
                status: StepStatus::Busy,
                pages: 0,
                tally: PageTally::default(),
            });
        };
        let result = self.run_locked(batch_id, direction);
        self.release(&lease);
        result
    }

    /// Request a stop by deleting the persisted cursor. Returns whether one existed.
    ///
    /// # Errors
    /// Returns [`SyncError::CursorStore`] when the cursor store fails.
    pub fn cancel(&self, batch_id: &str) -> SyncResult<bool> {
        let existed =
            self.cursors.cursor_load(batch_id).map_err(|err| cursor_error(&err))?.is_some();
        if existed {
            self.cursors.cursor_delete(batch_id).map_err(|err| cursor_error(&err))?;
            info!("cancelled batch {batch_id}");
        }
        Ok(existed)
    }

    /// # Errors
    /// Returns [`SyncError::CursorStore`] when the cursor store fails.
    pub fn status(&self, batch_id: &str) -> SyncResult<Option<CursorState>> {
        self.cursors.cursor_load(batch_id).map_err(|err| cursor_error(&err))
    }

    fn acquire(&self, batch_id: &str) -> SyncResult<Option<Lease>> {
        let stale_after = self.reconciler.config().lock_stale_after_secs;
        let lease =
            self.cursors.try_acquire(batch_id, stale_after).map_err(|err| cursor_error(&err))?;
        if lease.is_none() {
            warn!("batch {batch_id} is already running; skipping this invocation");
        }
        Ok(lease)
    }

    fn release(&self, lease: &Lease) {
        if let Err(err) = self.cursors.release(lease) {
            warn!("failed to release lease on batch {}: {err}", lease.batch_id);
        }
    }

    fn step_locked(
        &mut self,
        batch_id: &str,
        direction: Direction,
        page_size: Option<u64>,
    ) -> SyncResult<StepReport> {
        let default_size = self.reconciler.config().page_size;
        let size = page_size.unwrap_or(default_size);
        let mut stepper = Stepper::initialise(self.cursors, batch_id, direction, size)?;
        if stepper.state().direction != direction {
            return Err(SyncError::Conflict(format!(
                "batch {batch_id} is running {}, not {}",
                stepper.state().direction.as_str(),
                direction.as_str()
            )));
        }
        if let Some(size) = page_size {
            stepper.step_count_set(size)?;
        }

        if stepper.phase() == Phase::Done {
            let applied = AppliedPage::empty(&stepper, StepStatus::Finished);
            stepper.finish()?;
            return Ok(applied.into_report(stepper.state(), None));
        }

        match self.apply_page(&mut stepper) {
            Ok(applied) => Ok(applied.into_report(stepper.state(), None)),
            Err(interrupted) => {
                let err = interrupted.into_retryable()?;
                let offset = stepper.offset();
                warn!("batch {batch_id} page at offset {offset} will be retried: {err}");
                let applied = AppliedPage::empty(&stepper, StepStatus::Retry);
                Ok(applied.into_report(stepper.state(), Some(err.to_string())))
            }
        }
    }

    fn run_locked(&mut self, batch_id: &str, direction: Direction) -> SyncResult<RunReport> {
        let page_size = self.reconciler.config().page_size;
        let mut stepper = Stepper::ephemeral(batch_id, direction, page_size)?;
        let mut pages = 0;
        let mut total = PageTally::default();
        loop {
            let applied = self.apply_page(&mut stepper).map_err(Interrupted::into_error)?;
            pages += 1;
            total.absorb(applied.tally);
            if applied.status == StepStatus::Finished {
                break;
            }
        }
        info!("unpaged {} run {batch_id} finished after {pages} pages", direction.as_str());
        Ok(RunReport {
            batch_id: batch_id.to_string(),
            direction,
            status: StepStatus::Finished,
            pages,
            tally: total,
        })
    }

    /// Apply the page under the cursor, then advance, change phase, or finish.
    /// Nothing is saved unless the whole page went through.
    fn apply_page(&mut self, stepper: &mut Stepper<'_>) -> Result<AppliedPage, Interrupted> {
        let direction = stepper.state().direction;
        let phase = stepper.phase();
        if stepper.offset() == 0 {
            let total = self.count(direction, phase).map_err(Interrupted::Read)?;
            stepper.set_total(total);
        }

        let range = stepper.get();
        let page_size = stepper.step_count_get();
        let page =
            self.read_page(direction, phase, range.from, page_size).map_err(Interrupted::Read)?;
        let mut applied = AppliedPage {
            status: StepStatus::Progressed,
            phase,
            from: range.from,
            count: page.len() as u64,
            total: stepper.state().total,
            tally: self.process(direction, phase, page)?,
        };

        let consumed = page_size.saturating_sub(applied.tally.vanished);
        let next = self
            .read_page(direction, phase, range.from + consumed, 1)
            .map_err(Interrupted::Read)?;

        info!(
            "batch {} {}: items {}..{} of {} (changed={} skipped={} failed={})",
            stepper.state().batch_id,
            phase_label(direction, phase),
            applied.from,
            applied.from + applied.count,
            applied.total,
            applied.tally.changed,
            applied.tally.skipped,
            applied.tally.failed
        );

        if !next.is_empty() {
            stepper.advance(consumed);
            stepper.save()?;
            return Ok(applied);
        }
        match phase.next() {
            Phase::Done => {
                stepper.finish()?;
                info!("batch {} finished", stepper.state().batch_id);
                applied.status = StepStatus::Finished;
            }
            next_phase => {
                stepper.enter_phase(next_phase);
                stepper.save()?;
                info!(
                    "batch {} entering phase {}",
                    stepper.state().batch_id,
                    phase_label(direction, next_phase)
                );
            }
        }
        Ok(applied)
    }

    fn count(&self, direction: Direction, phase: Phase) -> SyncResult<u64> {
        let stores = self.reconciler.stores;
        match listing(direction, phase) {
            Listing::Community => stores.community.membership_count().during("membership.count"),
            Listing::Directory => {
                stores.directory.mirror_membership_count().during("mirror_membership.count")
            }
        }
    }

    fn read_page(
        &self,
        direction: Direction,
        phase: Phase,
        offset: u64,
        limit: u64,
    ) -> SyncResult<Page> {
        let stores = self.reconciler.stores;
        match listing(direction, phase) {
            Listing::Community => stores
                .community
                .memberships_page(offset, limit)
                .during("membership.page")
                .map(Page::Community),
            Listing::Directory => stores
                .directory
                .mirror_memberships_page(offset, limit)
                .during("mirror_membership.page")
                .map(Page::Directory),
        }
    }

    fn process(&mut self, direction: Direction, phase: Phase, page: Page) -> SyncResult<PageTally> {
        let mut tally = PageTally::default();
        match page {
            Page::Community(items) => {
                for item in items {
                    let result = match phase {
                        Phase::Remove => self.reconciler.prune_community_membership(item),
                        _ => self.populate_from_community(item),
                    };
                    let vanished = direction == Direction::DirectoryToCommunity
                        && phase == Phase::Remove
                        && matches!(&result, Ok(outcome) if outcome.membership_changed);
                    settle(&mut tally, result)?;
                    if vanished {
                        tally.vanished += 1;
                    }
                }
            }
            Page::Directory(items) => {
                for item in items {
                    let result = match phase {
                        Phase::Remove => self.reconciler.prune_mirror_membership(item),
                        _ => self.populate_from_directory(item),
                    };
                    settle(&mut tally, result)?;
                }
            }
        }
        Ok(tally)
    }

    fn populate_from_community(&mut self, item: CommunityMembership) -> SyncResult<SyncOutcome> {
        let Some(group) =
            self.reconciler.stores.community.group_get(item.group).during("group.get")?
        else {
            return Ok(SyncOutcome::skipped(SkipReason::NoCommunityGroup));
        };
        let (pair, created) = self.reconciler.ensure_pair_tracked(&group)?;
        if created {
            self.reconciler.mirror_hierarchy(group.id, group.parent)?;
        }
        let change = MembershipChange::add(item.role);
        self.reconciler.sync_membership(item.group, pair, item.member, change)
    }

    fn populate_from_directory(&mut self, item: MembershipRecord) -> SyncResult<SyncOutcome> {
        if item.status != MembershipStatus::Added {
            return Ok(SyncOutcome::default());
        }
        self.reconciler.sync_contact(item.group, item.contact, MemberAction::Add)
    }
}

/// The window of one page that was applied, captured before the cursor moved.
struct AppliedPage {
    status: StepStatus,
    phase: Phase,
    from: u64,
    count: u64,
    total: u64,
    tally: PageTally,
}

impl AppliedPage {
    fn empty(stepper: &Stepper<'_>, status: StepStatus) -> Self {
        Self {
            status,
            phase: stepper.phase(),
            from: stepper.offset(),
            count: 0,
            total: stepper.state().total,
            tally: PageTally::default(),
        }
    }

    fn into_report(self, state: &CursorState, message: Option<String>) -> StepReport {
        StepReport {
            batch_id: state.batch_id.clone(),
            direction: state.direction,
            status: self.status,
            finished: self.status == StepStatus::Finished,
            phase: self.phase,
            phase_label: phase_label(state.direction, self.phase),
            range_from: self.from,
            range_to: self.from + self.count,
            total: self.total,
            tally: self.tally,
            message,
        }
    }
}

enum Listing {
    Community,
    Directory,
}

fn listing(direction: Direction, phase: Phase) -> Listing {
    match (direction, phase) {
        (Direction::CommunityToDirectory, Phase::Populate)
        | (Direction::DirectoryToCommunity, Phase::Remove | Phase::Done) => Listing::Community,
        (Direction::CommunityToDirectory, Phase::Remove | Phase::Done)
        | (Direction::DirectoryToCommunity, Phase::Populate) => Listing::Directory,
    }
}

/// Fold one item result into the tally. Transient failures abort the page so the
/// cursor stays put; hard failures are counted and the page carries on.
fn settle(tally: &mut PageTally, result: SyncResult<SyncOutcome>) -> SyncResult<()> {
    match result {
        Ok(outcome) => {
            tally.record(outcome);
            Ok(())
        }
        Err(err) if err.is_transient() => Err(err),
        Err(err) => {
            error!("batch item failed: {err}");
            tally.processed += 1;
            tally.failed += 1;
            Ok(())
        }
    }
}
