//! Flag classification.
//!
//! Decides the response code for one submitted flag. Checks run in a fixed
//! order and the first match wins:
//! 1. Format or lookup failure: `INV`
//! 2. Flag owned by the submitter: `OWN`
//! 3. Already submitted by this team: `DUP`
//! 4. Issued too many ticks ago: `OLD`
//! 5. Otherwise the submission is recorded: `OK`
//!
//! Any store failure yields `ERR` without recording anything.

use crate::protocol::{FlagFormat, ResponseCode};
use crate::storage::{FlagStore, StoreError};
use crate::team::TeamId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Classifies submissions against a shared flag store.
pub struct Validator {
    store: Arc<dyn FlagStore>,
    format: FlagFormat,
    /// Number of ticks a flag stays submittable
    valid_ticks: u64,
    stats: ValidatorStats,
}

impl Validator {
    pub fn new(store: Arc<dyn FlagStore>, format: FlagFormat, valid_ticks: u64) -> Self {
        Self {
            store,
            format,
            valid_ticks,
            stats: ValidatorStats::default(),
        }
    }

    /// Classify `flag` as submitted by `team`.
    pub fn classify(&self, flag: &[u8], team: TeamId) -> ResponseCode {
        let code = match self.check(flag, team) {
            Ok(code) => code,
            Err(e) => {
                warn!(error = %e, team, "Flag store failure");
                ResponseCode::Err
            }
        };

        self.stats.count(&code);
        code
    }

    fn check(&self, flag: &[u8], team: TeamId) -> Result<ResponseCode, StoreError> {
        if !self.format.matches(flag) {
            return Ok(ResponseCode::Inv);
        }
        // The flag alphabet is ASCII, so this only fails on a misconfigured prefix
        let Ok(flag) = std::str::from_utf8(flag) else {
            return Ok(ResponseCode::Inv);
        };

        let Some(info) = self.store.lookup(flag)? else {
            trace!(flag, "Unknown flag");
            return Ok(ResponseCode::Inv);
        };

        if info.team == team {
            return Ok(ResponseCode::Own);
        }

        if self.store.is_submitted(flag, team)? {
            return Ok(ResponseCode::Dup);
        }

        let current_tick = self.store.current_tick()?;
        if info.tick.saturating_add(self.valid_ticks) <= current_tick {
            return Ok(ResponseCode::Old);
        }

        // Losing the insert race to a concurrent submission is a duplicate
        if self.store.record(flag, team)? {
            Ok(ResponseCode::Ok)
        } else {
            Ok(ResponseCode::Dup)
        }
    }

    pub fn stats(&self) -> &ValidatorStats {
        &self.stats
    }
}

/// Per-code response counters
#[derive(Debug, Default)]
pub struct ValidatorStats {
    ok: AtomicU64,
    dup: AtomicU64,
    own: AtomicU64,
    old: AtomicU64,
    inv: AtomicU64,
    err: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ok: u64,
    pub dup: u64,
    pub own: u64,
    pub old: u64,
    pub inv: u64,
    pub err: u64,
}

impl StatsSnapshot {
    #[allow(dead_code)]
    pub fn total(&self) -> u64 {
        self.ok + self.dup + self.own + self.old + self.inv + self.err
    }
}

impl ValidatorStats {
    fn count(&self, code: &ResponseCode) {
        let counter = match code {
            ResponseCode::Ok => &self.ok,
            ResponseCode::Dup => &self.dup,
            ResponseCode::Own => &self.own,
            ResponseCode::Old => &self.old,
            ResponseCode::Inv => &self.inv,
            ResponseCode::Err => &self.err,
            ResponseCode::Other(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ok: self.ok.load(Ordering::Relaxed),
            dup: self.dup.load(Ordering::Relaxed),
            own: self.own.load(Ordering::Relaxed),
            old: self.old.load(Ordering::Relaxed),
            inv: self.inv.load(Ordering::Relaxed),
            err: self.err.load(Ordering::Relaxed),
        }
    }
}
