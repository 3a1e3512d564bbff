//! Archive verification report types.

use std::path::PathBuf;

use serde::Serialize;

/// An expected member absent from its archive.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[non_exhaustive]
pub struct MissingMember {
    /// Group name (archive file stem).
    pub group: String,
    /// Archive path.
    pub archive: PathBuf,
    /// Member name that was not found.
    pub member: String,
}

/// An archive that could not be opened or read.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[non_exhaustive]
pub struct ArchiveFailure {
    /// Group name (archive file stem).
    pub group: String,
    /// Archive path.
    pub archive: PathBuf,
    /// Human-readable description of the failure.
    pub message: String,
}

/// Result of checking a set of archives.
///
/// Callers must check both `missing_members` and `archive_errors`: an archive
/// error means that group was not checked at all.
#[derive(Debug, Clone, Serialize)]
#[non_exhaustive]
pub struct ArchiveReport {
    /// Directory holding the archives.
    pub output_path: PathBuf,
    /// Number of archives opened and listed.
    pub archives_checked: usize,
    /// No missing members and no archive errors.
    pub ok: bool,
    /// Expected members not present.
    pub missing_members: Vec<MissingMember>,
    /// Archives that could not be read.
    pub archive_errors: Vec<ArchiveFailure>,
}

impl ArchiveReport {
    /// Number of missing members.
    #[must_use]
    pub fn missing_count(&self) -> usize {
        self.missing_members.len()
    }
}

impl MissingMember {
    /// Format for human-readable output.
    #[must_use]
    pub fn format_human_readable(&self) -> String {
        format!("{}: missing member '{}'", self.archive.display(), self.member)
    }
}

impl ArchiveFailure {
    /// Format for human-readable output.
    #[must_use]
    pub fn format_human_readable(&self) -> String {
        format!("{}: [archive error] {}", self.archive.display(), self.message)
    }
}
