//! Communicator construction for distributed training workers.
//!
//! A [`Communicator`] is the handle a worker creates to join its group before
//! any collective operation. Only construction is provided here; collectives
//! belong to the training framework.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::info;
use trainkit_world::World;

/// Communicator topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommunicatorKind {
    /// Plain world communicator, no topology awareness.
    #[default]
    Naive,
    /// Single flat all-reduce ring.
    Flat,
    /// Intra-node reduce, inter-node all-reduce.
    Hierarchical,
    /// Two-dimensional all-reduce across and within nodes.
    TwoDimensional,
    /// NCCL for all traffic.
    PureNccl,
}

impl CommunicatorKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Naive,
        Self::Flat,
        Self::Hierarchical,
        Self::TwoDimensional,
        Self::PureNccl,
    ];

    /// Lowercase name used on the command line.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Naive => "naive",
            Self::Flat => "flat",
            Self::Hierarchical => "hierarchical",
            Self::TwoDimensional => "two_dimensional",
            Self::PureNccl => "pure_nccl",
        }
    }

    /// Whether the topology needs to know each worker's node-local rank.
    #[must_use]
    pub fn needs_local_rank(self) -> bool {
        matches!(
            self,
            Self::Hierarchical | Self::TwoDimensional | Self::PureNccl
        )
    }
}

impl fmt::Display for CommunicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CommunicatorKind {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| CommError::UnknownKind(s.to_owned()))
    }
}

/// Communicator construction failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommError {
    /// The kind name is not recognised.
    #[error("unknown communicator kind '{0}'")]
    UnknownKind(String),

    /// The topology needs a local rank the launcher did not provide.
    #[error("{kind} communicator requires a local rank, none reported for {world}")]
    MissingLocalRank {
        /// Requested kind.
        kind: CommunicatorKind,
        /// Worker's world.
        world: String,
    },
}

/// A worker's membership in a communication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Communicator {
    kind: CommunicatorKind,
    world: World,
}

impl Communicator {
    /// Topology.
    #[must_use]
    pub fn kind(&self) -> CommunicatorKind {
        self.kind
    }

    /// Global rank.
    #[must_use]
    pub fn rank(&self) -> u32 {
        self.world.rank()
    }

    /// Group size.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.world.size()
    }

    /// Node-local rank, if known.
    #[must_use]
    pub fn local_rank(&self) -> Option<u32> {
        self.world.local_rank()
    }
}

/// Create a communicator of `kind` for this worker.
///
/// # Errors
/// Returns [`CommError::MissingLocalRank`] if `kind` needs a local rank and
/// `world` has none.
pub fn create_communicator(
    kind: CommunicatorKind,
    world: &World,
) -> Result<Communicator, CommError> {
    if kind.needs_local_rank() && world.local_rank().is_none() {
        return Err(CommError::MissingLocalRank {
            kind,
            world: world.to_string(),
        });
    }
    info!(%kind, rank = world.rank(), size = world.size(), "communicator created");
    Ok(Communicator {
        kind,
        world: *world,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_parse_back() {
        for kind in CommunicatorKind::ALL {
            assert_eq!(kind.name().parse::<CommunicatorKind>().unwrap(), kind);
        }
        assert_eq!(
            "ring".parse::<CommunicatorKind>().unwrap_err(),
            CommError::UnknownKind("ring".to_owned())
        );
    }

    #[test]
    fn test_naive_needs_no_local_rank() {
        let world = World::new(1, 2, None).unwrap();
        let comm = create_communicator(CommunicatorKind::Naive, &world).unwrap();
        assert_eq!(comm.rank(), 1);
        assert_eq!(comm.size(), 2);
        assert_eq!(comm.kind(), CommunicatorKind::Naive);
    }

    #[test]
    fn test_hierarchical_requires_local_rank() {
        let world = World::new(1, 4, None).unwrap();
        let err = create_communicator(CommunicatorKind::Hierarchical, &world).unwrap_err();
        assert!(matches!(err, CommError::MissingLocalRank { .. }));

        let world = World::new(1, 4, Some(1)).unwrap();
        let comm = create_communicator(CommunicatorKind::Hierarchical, &world).unwrap();
        assert_eq!(comm.local_rank(), Some(1));
    }
}
