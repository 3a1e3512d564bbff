//! # trainkit
//!
//! Test utilities for distributed training and local-mode serving containers.
//!
//! - [`lock`]: file-backed lock that serializes tests sharing the local serving port
//! - [`predict`]: deploy, predict once, check the response length, always tear down
//! - [`archive`]: verify expected members in `<group>.tar.gz` output archives
//! - [`local`]: a locally-hosted endpoint to deploy models against
//! - [`fixture`]: failure-scenario entry points for distributed jobs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::path::Path;
//! use trainkit::{LocalEstimator, LocalModeConfig, LockConfig, PredictOptions};
//! use trainkit::{files_exist, predict_and_assert_response_length};
//!
//! let estimator = LocalEstimator::new(|row: &[f64]| vec![row.iter().sum()], LocalModeConfig::default());
//! let data = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
//! predict_and_assert_response_length(
//!     &estimator,
//!     &data,
//!     "local",
//!     &PredictOptions::default(),
//!     &LockConfig::default(),
//! )
//! .unwrap();
//!
//! let expected = BTreeMap::from([("model".to_owned(), vec!["model.npz"])]);
//! files_exist(Path::new("/opt/ml/output"), &expected).unwrap();
//! ```

pub mod archive;
pub mod codec;
pub mod comm;
mod config;
mod error;
pub mod fixture;
pub mod local;
pub mod lock;
pub mod output;
pub mod predict;
mod report;

pub use archive::{ArchiveError, files_exist, inspect_archives, list_members};
pub use comm::{CommError, Communicator, CommunicatorKind, create_communicator};
pub use config::{
    ConfigError, DEFAULT_LOCAL_MODE_PORT, DEFAULT_RELEASE_DELAY, LocalModeConfig, LockConfig,
    TestkitConfig,
};
pub use error::PredictError;
pub use fixture::FixtureError;
pub use local::{LocalEstimator, LocalPredictor};
pub use lock::{LocalModeLock, LocalModeLockGuard, LockError, with_local_mode_lock};
pub use predict::{Estimator, PredictOptions, Predictor, predict_and_assert_response_length};
pub use report::{ArchiveFailure, ArchiveReport, MissingMember};
pub use trainkit_world::{World, WorldError};
