#![allow(clippy::unwrap_used)]
//! Integration tests for `trainkit::files_exist` and `trainkit::inspect_archives`.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempDir;
use trainkit::{ArchiveError, files_exist, inspect_archives, list_members};

fn append_file<W: std::io::Write>(builder: &mut tar::Builder<W>, name: &str, content: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, content).unwrap();
}

fn write_tar_gz(dir: &Path, group: &str, members: &[&str]) {
    let file = File::create(dir.join(format!("{group}.tar.gz"))).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for member in members {
        append_file(&mut builder, member, member.as_bytes());
    }
    builder.into_inner().unwrap().finish().unwrap();
}

fn expect(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    pairs
        .iter()
        .map(|(group, files)| {
            (
                (*group).to_owned(),
                files.iter().map(|f| (*f).to_owned()).collect(),
            )
        })
        .collect()
}

#[test]
fn test_all_members_present() {
    let tmp = TempDir::new().unwrap();
    write_tar_gz(tmp.path(), "g", &["a", "b"]);

    files_exist(tmp.path(), &expect(&[("g", &["a", "b"])])).unwrap();
}

#[test]
fn test_missing_member_names_it() {
    let tmp = TempDir::new().unwrap();
    write_tar_gz(tmp.path(), "g", &["a", "b"]);

    let err = files_exist(tmp.path(), &expect(&[("g", &["a", "c"])])).unwrap_err();
    match err {
        ArchiveError::MemberNotFound { archive, member } => {
            assert_eq!(member, "c");
            assert!(archive.ends_with("g.tar.gz"));
        }
        other => panic!("expected MemberNotFound, got: {other:?}"),
    }
}

#[test]
fn test_multiple_groups() {
    let tmp = TempDir::new().unwrap();
    write_tar_gz(tmp.path(), "model", &["model.npz"]);
    write_tar_gz(
        tmp.path(),
        "output",
        &["data/accuracy.png", "data/loss.png", "data/log"],
    );

    files_exist(
        tmp.path(),
        &expect(&[
            ("model", &["model.npz"]),
            ("output", &["data/accuracy.png", "data/loss.png"]),
        ]),
    )
    .unwrap();
}

#[test]
fn test_empty_expectation_still_opens_archive() {
    let tmp = TempDir::new().unwrap();
    let err = files_exist(tmp.path(), &expect(&[("absent", &[])])).unwrap_err();
    assert!(matches!(err, ArchiveError::Open { .. }), "got: {err:?}");
}

#[test]
fn test_corrupt_archive_is_read_error() {
    let tmp = TempDir::new().unwrap();
    // gzip magic followed by garbage
    fs::write(tmp.path().join("g.tar.gz"), [0x1f, 0x8b, 0x00, 0x01, 0x02]).unwrap();

    let err = files_exist(tmp.path(), &expect(&[("g", &["a"])])).unwrap_err();
    assert!(matches!(err, ArchiveError::Read { .. }), "got: {err:?}");
}

#[test]
fn test_zero_byte_archive_is_read_error() {
    let tmp = TempDir::new().unwrap();
    File::create(tmp.path().join("g.tar.gz")).unwrap();

    let err = files_exist(tmp.path(), &expect(&[("g", &[])])).unwrap_err();
    assert!(matches!(err, ArchiveError::Read { .. }), "got: {err:?}");

    let err = files_exist(tmp.path(), &expect(&[("g", &["a"])])).unwrap_err();
    assert!(matches!(err, ArchiveError::Read { .. }), "got: {err:?}");
    assert!(err.to_string().contains("empty file"), "got: {err}");
}

#[test]
fn test_empty_gzip_stream_is_read_error() {
    let tmp = TempDir::new().unwrap();
    let file = File::create(tmp.path().join("g.tar.gz")).unwrap();
    GzEncoder::new(file, Compression::default()).finish().unwrap();

    let err = files_exist(tmp.path(), &expect(&[("g", &["a"])])).unwrap_err();
    assert!(matches!(err, ArchiveError::Read { .. }), "got: {err:?}");

    let report = inspect_archives(tmp.path(), &expect(&[("g", &[])]));
    assert!(!report.ok);
    assert_eq!(report.archives_checked, 0);
    assert_eq!(report.archive_errors.len(), 1);
}

#[test]
fn test_uncompressed_tar_with_gz_name_is_accepted() {
    let tmp = TempDir::new().unwrap();
    let file = File::create(tmp.path().join("g.tar.gz")).unwrap();
    let mut builder = tar::Builder::new(file);
    append_file(&mut builder, "a", b"a");
    builder.into_inner().unwrap();

    files_exist(tmp.path(), &expect(&[("g", &["a"])])).unwrap();
}

#[test]
fn test_directory_member_matches_with_or_without_slash() {
    let tmp = TempDir::new().unwrap();
    let file = File::create(tmp.path().join("g.tar.gz")).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_cksum();
    builder
        .append_data(&mut header, "checkpoints/", std::io::empty())
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap();

    assert_eq!(
        list_members(&tmp.path().join("g.tar.gz")).unwrap(),
        vec!["checkpoints".to_owned()]
    );
    files_exist(
        tmp.path(),
        &expect(&[("g", &["checkpoints", "checkpoints/"])]),
    )
    .unwrap();
}

#[test]
fn test_inspect_collects_every_finding() {
    let tmp = TempDir::new().unwrap();
    write_tar_gz(tmp.path(), "model", &["model.npz"]);
    write_tar_gz(tmp.path(), "output", &["data/log"]);

    let report = inspect_archives(
        tmp.path(),
        &expect(&[
            ("absent", &["x"]),
            ("model", &["model.npz", "optimizer.npz"]),
            ("output", &["data/loss.png", "data/log", "data/accuracy.png"]),
        ]),
    );

    assert!(!report.ok);
    assert_eq!(report.archives_checked, 2);
    assert_eq!(report.archive_errors.len(), 1);
    assert_eq!(report.archive_errors[0].group, "absent");
    let missing: Vec<&str> = report
        .missing_members
        .iter()
        .map(|m| m.member.as_str())
        .collect();
    assert_eq!(
        missing,
        ["optimizer.npz", "data/loss.png", "data/accuracy.png"]
    );
}

#[test]
fn test_inspect_ok_when_complete() {
    let tmp = TempDir::new().unwrap();
    write_tar_gz(tmp.path(), "g", &["a", "b"]);

    let report = inspect_archives(tmp.path(), &expect(&[("g", &["b", "a"])]));
    assert!(report.ok);
    assert_eq!(report.missing_count(), 0);
}
