//! Persisted offset/limit paging state for batches split across many short invocations.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, SyncError, SyncResult};
use crate::model::Direction;
use crate::traits::CursorStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Populate,
    Remove,
    Done,
}

impl Phase {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Populate => 0,
            Self::Remove => 1,
            Self::Done => 2,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Populate),
            1 => Some(Self::Remove),
            2 => Some(Self::Done),
            _ => None,
        }
    }

    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Self::Populate => Self::Remove,
            Self::Remove | Self::Done => Self::Done,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CursorState {
    pub batch_id: String,
    pub direction: Direction,
    pub phase: Phase,
    pub offset: u64,
    pub page_size: u64,
    pub total: u64,
}

/// Half-open range `[from, to)` of item positions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct StepRange {
    pub from: u64,
    pub to: u64,
}

pub struct Stepper<'a> {
    store: Option<&'a dyn CursorStore>,
    state: CursorState,
}

fn cursor_error(err: StoreError) -> SyncError {
    SyncError::CursorStore(err.to_string())
}

impl<'a> Stepper<'a> {
    /// Load the cursor for `batch_id`, creating and persisting it at offset 0 when absent.
    ///
    /// # Errors
    /// Returns [`SyncError::CursorStore`] when the cursor cannot be read or written, and
    /// [`SyncError::Validation`] for a zero page size.
    pub fn initialise(
        store: &'a dyn CursorStore,
        batch_id: &str,
        direction: Direction,
        page_size: u64,
    ) -> SyncResult<Self> {
        if let Some(state) = store.cursor_load(batch_id).map_err(cursor_error)? {
            return Ok(Self { store: Some(store), state });
        }
        let stepper = Self {
            store: Some(store),
            state: Self::fresh_state(batch_id, direction, page_size)?,
        };
        stepper.save()?;
        Ok(stepper)
    }

    /// Cursor that lives only in memory; used for unpaged runs.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] for a zero page size.
    pub fn ephemeral(batch_id: &str, direction: Direction, page_size: u64) -> SyncResult<Self> {
        Ok(Self { store: None, state: Self::fresh_state(batch_id, direction, page_size)? })
    }

    fn fresh_state(
        batch_id: &str,
        direction: Direction,
        page_size: u64,
    ) -> SyncResult<CursorState> {
        if batch_id.trim().is_empty() {
            return Err(SyncError::Validation("batch identifier MUST be non-empty".to_string()));
        }
        if page_size == 0 {
            return Err(SyncError::Validation("stepper page size MUST be >= 1".to_string()));
        }
        Ok(CursorState {
            batch_id: batch_id.to_string(),
            direction,
            phase: Phase::Populate,
            offset: 0,
            page_size,
            total: 0,
        })
    }

    #[must_use]
    pub fn state(&self) -> &CursorState {
        &self.state
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.state.offset
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Bounds of the page the next call will process.
    #[must_use]
    pub fn get(&self) -> StepRange {
        StepRange { from: self.state.offset, to: self.state.offset + self.state.page_size }
    }

    /// Bounds of the page after the current one.
    #[must_use]
    pub fn next_get(&self) -> StepRange {
        let from = self.state.offset + self.state.page_size;
        StepRange { from, to: from + self.state.page_size }
    }

    #[must_use]
    pub fn step_count_get(&self) -> u64 {
        self.state.page_size
    }

    /// # Errors
    /// Returns [`SyncError::Validation`] for zero; unpaged work is not a stepper phase.
    pub fn step_count_set(&mut self, page_size: u64) -> SyncResult<()> {
        if page_size == 0 {
            return Err(SyncError::Validation("stepper page size MUST be >= 1".to_string()));
        }
        self.state.page_size = page_size;
        Ok(())
    }

    pub fn next(&mut self) {
        self.advance(self.state.page_size);
    }

    /// Move forward by `consumed` positions. Pages whose records vanished from the
    /// listing while being processed consume fewer positions than the page size.
    pub fn advance(&mut self, consumed: u64) {
        self.state.offset += consumed;
    }

    pub fn set_total(&mut self, total: u64) {
        self.state.total = total;
    }

    /// Move to `phase`, rewinding to offset 0.
    pub fn enter_phase(&mut self, phase: Phase) {
        self.state.phase = phase;
        self.state.offset = 0;
        self.state.total = 0;
    }

    /// # Errors
    /// Returns [`SyncError::CursorStore`] when persistence fails.
    pub fn save(&self) -> SyncResult<()> {
        match self.store {
            Some(store) => store.cursor_save(&self.state).map_err(cursor_error),
            None => Ok(()),
        }
    }

    /// Mark the run done and delete the persisted cursor; the run is complete for
    /// external callers.
    ///
    /// # Errors
    /// Returns [`SyncError::CursorStore`] when the delete fails.
    pub fn finish(&mut self) -> SyncResult<()> {
        self.state.phase = Phase::Done;
        if let Some(store) = self.store {
            store.cursor_delete(&self.state.batch_id).map_err(cursor_error)?;
        }
        Ok(())
    }
}
