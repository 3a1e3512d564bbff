//! Failure-scenario fixtures for distributed training jobs.
//!
//! These are entry points that misbehave on purpose. A test harness launches
//! one under its distributed job launcher and checks that the orchestration
//! layer reports the failure instead of waiting forever.

use thiserror::Error;
use tracing::error;
use trainkit_world::World;

use crate::comm::{CommError, Communicator, CommunicatorKind, create_communicator};

/// Message of the injected failure.
pub const INJECTED_FAILURE: &str = "failure!";

/// Why a fixture stopped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FixtureError {
    /// The failure the fixture exists to raise.
    #[error("{message} (injected on rank {rank} of {size})")]
    Injected {
        /// Failure message.
        message: &'static str,
        /// Rank that failed.
        rank: u32,
        /// World size.
        size: u32,
    },

    /// A surviving rank could not build its communicator.
    #[error(transparent)]
    Comm(#[from] CommError),
}

/// Training entry point whose rank zero fails before joining the group.
///
/// Rank zero returns [`FixtureError::Injected`] without constructing any
/// communicator. Every other rank constructs a `kind` communicator, which in
/// a real job would then block in a collective waiting for rank zero. A job
/// that stalls here instead of failing is the bug this fixture exposes.
///
/// # Errors
/// Always on rank zero; on other ranks only if the communicator cannot be
/// constructed.
pub fn train(world: &World, kind: CommunicatorKind) -> Result<Communicator, FixtureError> {
    if world.is_root() {
        error!(%world, "injecting failure before communicator creation");
        return Err(FixtureError::Injected {
            message: INJECTED_FAILURE,
            rank: world.rank(),
            size: world.size(),
        });
    }
    Ok(create_communicator(kind, world)?)
}
