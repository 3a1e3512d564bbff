//! Distributed world discovery.
//!
//! Reads the calling worker's rank, world size and (when available) local rank
//! from the environment variables set by common process launchers. This crate is
//! the single source of truth for "who am I in the job", used by the `trainkit`
//! library and the `trainkit` CLI.

use std::fmt;

use thiserror::Error;

/// Environment variable names used by one launcher family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LauncherVars {
    /// Human-readable launcher name, used in logs and errors.
    pub launcher: &'static str,
    /// Variable holding the global rank.
    pub rank: &'static str,
    /// Variable holding the world size.
    pub size: &'static str,
    /// Variable holding the node-local rank.
    pub local_rank: &'static str,
}

/// Launcher families in lookup order. The first family whose rank variable is
/// set is the one used.
pub const LAUNCHERS: &[LauncherVars] = &[
    LauncherVars {
        launcher: "openmpi",
        rank: "OMPI_COMM_WORLD_RANK",
        size: "OMPI_COMM_WORLD_SIZE",
        local_rank: "OMPI_COMM_WORLD_LOCAL_RANK",
    },
    LauncherVars {
        launcher: "pmi",
        rank: "PMI_RANK",
        size: "PMI_SIZE",
        local_rank: "MPI_LOCALRANKID",
    },
    LauncherVars {
        launcher: "generic",
        rank: "RANK",
        size: "WORLD_SIZE",
        local_rank: "LOCAL_RANK",
    },
];

/// Errors from world discovery.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorldError {
    /// A variable is set but is not a non-negative integer.
    #[error("{var}={value:?} is not a valid non-negative integer")]
    InvalidValue {
        /// Variable name.
        var: String,
        /// Raw value found in the environment.
        value: String,
    },

    /// The rank variable is set but its companion size variable is not.
    #[error("{rank_var} is set but {size_var} is missing")]
    MissingSize {
        /// Rank variable that was found.
        rank_var: String,
        /// Size variable that was expected alongside it.
        size_var: String,
    },

    /// The world size is zero.
    #[error("world size must be at least 1")]
    EmptyWorld,

    /// The rank does not fit in the world.
    #[error("rank {rank} is out of range for world size {size}")]
    RankOutOfRange {
        /// Reported rank.
        rank: u32,
        /// Reported world size.
        size: u32,
    },
}

/// The calling worker's place in a distributed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct World {
    rank: u32,
    size: u32,
    local_rank: Option<u32>,
}

impl World {
    /// Build a world from explicit values.
    ///
    /// # Errors
    /// Returns an error if `size` is zero or `rank >= size`.
    pub fn new(rank: u32, size: u32, local_rank: Option<u32>) -> Result<Self, WorldError> {
        if size == 0 {
            return Err(WorldError::EmptyWorld);
        }
        if rank >= size {
            return Err(WorldError::RankOutOfRange { rank, size });
        }
        Ok(Self {
            rank,
            size,
            local_rank,
        })
    }

    /// A single-process world: rank 0 of 1.
    #[must_use]
    pub fn singleton() -> Self {
        Self {
            rank: 0,
            size: 1,
            local_rank: Some(0),
        }
    }

    /// Discover the world from the process environment.
    ///
    /// # Errors
    /// See [`World::from_lookup`].
    pub fn from_env() -> Result<Self, WorldError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Discover the world through an arbitrary variable lookup.
    ///
    /// Launcher families are tried in [`LAUNCHERS`] order. When none of them
    /// sets a rank, the process is treated as a singleton world, which is what
    /// an MPI world communicator reports outside a launcher.
    ///
    /// # Errors
    /// Returns an error if a variable holds a non-integer, if a rank is set
    /// without its size, or if the rank/size pair is inconsistent.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, WorldError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for vars in LAUNCHERS {
            let Some(rank) = read_var(&lookup, vars.rank)? else {
                continue;
            };
            let size = read_var(&lookup, vars.size)?.ok_or_else(|| WorldError::MissingSize {
                rank_var: vars.rank.to_owned(),
                size_var: vars.size.to_owned(),
            })?;
            let local_rank = read_var(&lookup, vars.local_rank)?;
            return Self::new(rank, size, local_rank);
        }
        Ok(Self::singleton())
    }

    /// Global rank of the calling worker.
    #[must_use]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Number of workers in the job.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Node-local rank, when the launcher reports one.
    #[must_use]
    pub fn local_rank(&self) -> Option<u32> {
        self.local_rank
    }

    /// Whether this worker is rank zero.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.rank == 0
    }
}

impl fmt::Display for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank {}/{}", self.rank, self.size)?;
        if let Some(local) = self.local_rank {
            write!(f, " (local {local})")?;
        }
        Ok(())
    }
}

/// Read and parse one variable. Unset and empty values are both `None`.
fn read_var<F>(lookup: &F, name: &str) -> Result<Option<u32>, WorldError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match trimmed.parse::<u32>() {
        Ok(value) => Ok(Some(value)),
        Err(_) => Err(WorldError::InvalidValue {
            var: name.to_owned(),
            value: raw,
        }),
    }
}
