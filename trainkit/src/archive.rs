//! Tarball content verification.
//!
//! Training jobs package their outputs as `<group>.tar.gz` under an output
//! directory. These helpers check that expected members made it into each
//! archive. Archives are opened with transparent compression: gzip is detected
//! from the magic bytes, anything else is read as a plain tar.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::debug;

use crate::report::{ArchiveFailure, ArchiveReport, MissingMember};

/// Suffix appended to a group name to form its archive file name.
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Failure to verify archive contents.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive file could not be opened.
    #[error("failed to open archive {}: {source}", path.display())]
    Open {
        /// Archive path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The archive could not be read (truncated, corrupt, not a tar).
    #[error("failed to read archive {}: {source}", path.display())]
    Read {
        /// Archive path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An expected member is absent.
    #[error("no member named '{member}' in archive {}", archive.display())]
    MemberNotFound {
        /// Archive path.
        archive: PathBuf,
        /// Missing member name.
        member: String,
    },
}

/// Archive path for `group` under `output_path`.
#[must_use]
pub fn archive_path(output_path: &Path, group: &str) -> PathBuf {
    output_path.join(format!("{group}{ARCHIVE_SUFFIX}"))
}

/// Member names drop a trailing `/`, so directory entries match either way.
fn normalize_member(name: &str) -> &str {
    name.strip_suffix('/').unwrap_or(name)
}

/// Open `path` for reading. An archive whose (decompressed) stream holds no
/// bytes at all is rejected as unreadable rather than listed as empty.
fn open_archive(path: &Path) -> Result<Archive<BufReader<Box<dyn Read>>>, ArchiveError> {
    let read_err = |source| ArchiveError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(|source| ArchiveError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut magic = [0_u8; 2];
    let sniffed = file.read(&mut magic).map_err(read_err)?;
    file.seek(SeekFrom::Start(0)).map_err(read_err)?;

    let stream: Box<dyn Read> = if sniffed == GZIP_MAGIC.len() && magic == GZIP_MAGIC {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(file)
    };

    let mut reader = BufReader::new(stream);
    if reader.fill_buf().map_err(read_err)?.is_empty() {
        return Err(read_err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty file",
        )));
    }
    Ok(Archive::new(reader))
}

/// Names of every member in the archive at `path`, in archive order.
///
/// # Errors
/// Returns an error if the archive is missing, empty, unreadable or corrupt.
pub fn list_members(path: &Path) -> Result<Vec<String>, ArchiveError> {
    let read_err = |source| ArchiveError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut archive = open_archive(path)?;
    let mut names = Vec::new();
    for entry in archive.entries().map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let entry_path = entry.path().map_err(read_err)?;
        names.push(normalize_member(&entry_path.to_string_lossy()).to_owned());
    }
    debug!(archive = %path.display(), members = names.len(), "listed archive");
    Ok(names)
}

fn member_set(path: &Path) -> Result<BTreeSet<String>, ArchiveError> {
    Ok(list_members(path)?.into_iter().collect())
}

/// Assert that every expected member exists in its group's archive.
///
/// `directory_file_map` maps a group name to the member names expected in
/// `<output_path>/<group>.tar.gz`. Groups are checked in map order and members
/// in list order; the first absent member stops the check.
///
/// # Errors
/// - [`ArchiveError::MemberNotFound`] naming the first absent member.
/// - [`ArchiveError::Open`] / [`ArchiveError::Read`] if an archive is missing
///   or corrupt.
pub fn files_exist<S>(
    output_path: &Path,
    directory_file_map: &BTreeMap<String, Vec<S>>,
) -> Result<(), ArchiveError>
where
    S: AsRef<str>,
{
    for (group, files) in directory_file_map {
        let path = archive_path(output_path, group);
        let members = member_set(&path)?;
        for file in files {
            let wanted = normalize_member(file.as_ref());
            if !members.contains(wanted) {
                return Err(ArchiveError::MemberNotFound {
                    archive: path,
                    member: file.as_ref().to_owned(),
                });
            }
        }
    }
    Ok(())
}

/// Check every group and collect all findings instead of stopping at the first.
///
/// An archive that cannot be opened or read is recorded as a failure for its
/// group; the remaining groups are still checked.
#[must_use]
pub fn inspect_archives<S>(
    output_path: &Path,
    directory_file_map: &BTreeMap<String, Vec<S>>,
) -> ArchiveReport
where
    S: AsRef<str>,
{
    let mut missing_members = Vec::new();
    let mut archive_errors = Vec::new();
    let mut archives_checked: usize = 0;

    for (group, files) in directory_file_map {
        let path = archive_path(output_path, group);
        let members = match member_set(&path) {
            Ok(members) => members,
            Err(e) => {
                archive_errors.push(ArchiveFailure {
                    group: group.clone(),
                    archive: path,
                    message: e.to_string(),
                });
                continue;
            }
        };
        archives_checked += 1;

        missing_members.extend(
            files
                .iter()
                .filter(|file| !members.contains(normalize_member(file.as_ref())))
                .map(|file| MissingMember {
                    group: group.clone(),
                    archive: path.clone(),
                    member: file.as_ref().to_owned(),
                }),
        );
    }

    let ok = missing_members.is_empty() && archive_errors.is_empty();
    ArchiveReport {
        output_path: output_path.to_path_buf(),
        archives_checked,
        ok,
        missing_members,
        archive_errors,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_path_appends_suffix() {
        assert_eq!(
            archive_path(Path::new("/out"), "model"),
            PathBuf::from("/out/model.tar.gz")
        );
    }

    #[test]
    fn test_normalize_member_strips_trailing_slash() {
        assert_eq!(normalize_member("checkpoints/"), "checkpoints");
        assert_eq!(normalize_member("model.npz"), "model.npz");
    }

    #[test]
    fn test_missing_archive_is_open_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let map = BTreeMap::from([("model".to_owned(), vec!["model.npz"])]);
        let err = files_exist(tmp.path(), &map).unwrap_err();
        assert!(matches!(err, ArchiveError::Open { .. }), "got: {err:?}");
    }
}
