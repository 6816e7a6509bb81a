//! Flag store: issued flags and submission records.
//!
//! Flags are issued by the gameserver, not by this process. The submission
//! server only needs to:
//! - Look up the owning team and issuing tick of a flag
//! - Check whether a team already submitted a flag
//! - Record a first submission (atomic insert-if-absent)
//!
//! `MemoryStore` keeps this state in process. Issued flags are seeded from a
//! TOML file exported by the issuing side and can be refreshed while running.

use crate::clock::{GameClock, Tick};
use crate::team::TeamId;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, trace};

/// Issuance data for a single flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagInfo {
    /// Team the flag was planted for
    pub team: TeamId,
    /// Tick the flag was issued in
    pub tick: Tick,
}

/// First successful submission of a flag by a team.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct SubmissionRecord {
    pub team: TeamId,
    pub submitted_at: DateTime<Utc>,
}

/// Backing store used by the validator.
///
/// Implementations must make `record` atomic: of several concurrent calls
/// for the same (flag, team) pair exactly one returns `Ok(true)`. A call
/// that returns `Err` must not have recorded anything.
pub trait FlagStore: Send + Sync {
    /// Find the issuance data of a flag. `None` means it was never issued.
    fn lookup(&self, flag: &str) -> Result<Option<FlagInfo>, StoreError>;

    /// Whether `team` already has a submission record for `flag`.
    fn is_submitted(&self, flag: &str, team: TeamId) -> Result<bool, StoreError>;

    /// Record a submission. Returns `false` if one already existed.
    fn record(&self, flag: &str, team: TeamId) -> Result<bool, StoreError>;

    /// Current competition tick.
    fn current_tick(&self) -> Result<Tick, StoreError>;

    /// Pull new issuance data from the backing source, returning the number
    /// of known flags afterwards.
    fn refresh(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// On-disk format of the issued flags file
#[derive(Debug, Deserialize, Default)]
struct FlagsFile {
    #[serde(default, rename = "flag")]
    flags: Vec<IssuedFlag>,
}

#[derive(Debug, Deserialize)]
struct IssuedFlag {
    flag: String,
    team: TeamId,
    tick: Tick,
}

/// Thread-safe in-memory flag store.
pub struct MemoryStore {
    /// Issued flags
    flags: RwLock<HashMap<String, FlagInfo>>,
    /// Submission records, keyed by flag then submitting team
    submissions: RwLock<HashMap<String, HashMap<TeamId, SubmissionRecord>>>,
    /// Source of the current tick
    clock: GameClock,
    /// File the issued flags are loaded from
    source: Option<PathBuf>,
}

impl MemoryStore {
    /// Create an empty store with no backing file.
    pub fn new(clock: GameClock) -> Self {
        Self {
            flags: RwLock::new(HashMap::new()),
            submissions: RwLock::new(HashMap::new()),
            clock,
            source: None,
        }
    }

    /// Create a store seeded from an issued flags file.
    ///
    /// The file must exist and parse; later refreshes re-read it.
    pub fn from_file(path: impl AsRef<Path>, clock: GameClock) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let issued = read_flags_file(&path)?;

        let store = Self {
            source: Some(path.clone()),
            ..Self::new(clock)
        };
        let count = store.insert_issued(issued)?;

        info!(path = %path.display(), flags = count, "Loaded issued flags");
        Ok(store)
    }

    /// Register an issued flag.
    #[allow(dead_code)]
    pub fn issue(&self, flag: &str, team: TeamId, tick: Tick) -> Result<(), StoreError> {
        let mut flags = self.flags.write().map_err(|_| StoreError::Poisoned)?;
        flags.insert(flag.to_string(), FlagInfo { team, tick });
        Ok(())
    }

    /// Number of issued flags.
    pub fn len(&self) -> usize {
        self.flags.read().map(|flags| flags.len()).unwrap_or(0)
    }

    /// Number of submission records across all flags and teams.
    #[allow(dead_code)]
    pub fn submission_count(&self) -> usize {
        self.submissions
            .read()
            .map(|subs| subs.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }

    fn insert_issued(&self, issued: Vec<IssuedFlag>) -> Result<usize, StoreError> {
        let mut flags = self.flags.write().map_err(|_| StoreError::Poisoned)?;
        for entry in issued {
            flags.insert(
                entry.flag,
                FlagInfo {
                    team: entry.team,
                    tick: entry.tick,
                },
            );
        }
        Ok(flags.len())
    }
}

impl FlagStore for MemoryStore {
    fn lookup(&self, flag: &str) -> Result<Option<FlagInfo>, StoreError> {
        let flags = self.flags.read().map_err(|_| StoreError::Poisoned)?;
        Ok(flags.get(flag).copied())
    }

    fn is_submitted(&self, flag: &str, team: TeamId) -> Result<bool, StoreError> {
        let subs = self.submissions.read().map_err(|_| StoreError::Poisoned)?;
        Ok(subs
            .get(flag)
            .map(|teams| teams.contains_key(&team))
            .unwrap_or(false))
    }

    fn record(&self, flag: &str, team: TeamId) -> Result<bool, StoreError> {
        let mut subs = self.submissions.write().map_err(|_| StoreError::Poisoned)?;
        let teams = subs.entry(flag.to_string()).or_default();

        if teams.contains_key(&team) {
            trace!(flag, team, "Submission already recorded");
            return Ok(false);
        }

        teams.insert(
            team,
            SubmissionRecord {
                team,
                submitted_at: Utc::now(),
            },
        );
        trace!(flag, team, "Recorded submission");
        Ok(true)
    }

    fn current_tick(&self) -> Result<Tick, StoreError> {
        Ok(self.clock.current_tick())
    }

    fn refresh(&self) -> Result<usize, StoreError> {
        let Some(path) = &self.source else {
            return Ok(self.len());
        };

        let issued = read_flags_file(path)?;
        let count = self.insert_issued(issued)?;
        debug!(path = %path.display(), flags = count, "Refreshed issued flags");
        Ok(count)
    }
}

fn read_flags_file(path: &Path) -> Result<Vec<IssuedFlag>, StoreError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| StoreError::FileRead(path.to_path_buf(), e))?;
    let file: FlagsFile =
        toml::from_str(&contents).map_err(|e| StoreError::FileParse(path.to_path_buf(), e))?;
    Ok(file.flags)
}

/// Flag store errors
#[derive(Debug)]
pub enum StoreError {
    /// Issued flags file could not be read
    FileRead(PathBuf, std::io::Error),
    /// Issued flags file is malformed
    FileParse(PathBuf, toml::de::Error),
    /// A lock was poisoned by a panicking writer
    Poisoned,
    /// The backing store cannot be reached
    #[allow(dead_code)]
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::FileRead(path, e) => {
                write!(f, "Failed to read flags file '{}': {}", path.display(), e)
            }
            StoreError::FileParse(path, e) => {
                write!(f, "Failed to parse flags file '{}': {}", path.display(), e)
            }
            StoreError::Poisoned => write!(f, "Flag store lock poisoned"),
            StoreError::Unavailable(msg) => write!(f, "Flag store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}
