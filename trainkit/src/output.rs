//! Shared output formatting for archive reports.
//!
//! Provides JSON and plain-text formatters for `ArchiveReport`.
//! Color/terminal formatting is the CLI's concern.

use std::io::Write;

use crate::report::ArchiveReport;

/// Format an `ArchiveReport` as JSON to a writer.
///
/// # Errors
///
/// Returns an error if serialization or writing fails.
pub fn write_json(report: &ArchiveReport, writer: &mut dyn Write) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    writeln!(writer, "{json}")?;
    Ok(())
}

/// Format an `ArchiveReport` as human-readable plain text to a writer.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_human(report: &ArchiveReport, writer: &mut dyn Write) -> anyhow::Result<()> {
    writeln!(writer)?;
    writeln!(writer, "{}", "=".repeat(80))?;
    writeln!(writer, "  ARCHIVE CONTENTS")?;
    writeln!(writer, "{}", "=".repeat(80))?;
    writeln!(writer)?;
    writeln!(writer, "  Output path:      {}", report.output_path.display())?;
    writeln!(writer, "  Archives checked: {}", report.archives_checked)?;
    writeln!(writer, "  Archive errors:   {}", report.archive_errors.len())?;
    writeln!(writer, "  Missing members:  {}", report.missing_count())?;
    writeln!(writer)?;

    if !report.archive_errors.is_empty() {
        writeln!(writer, "{}", "-".repeat(80))?;
        writeln!(writer, "  ARCHIVE ERRORS (archives that could not be read)")?;
        writeln!(writer, "{}", "-".repeat(80))?;
        for failure in &report.archive_errors {
            writeln!(writer, "{}", failure.format_human_readable())?;
        }
        writeln!(writer)?;
    }

    if !report.missing_members.is_empty() {
        writeln!(writer, "{}", "-".repeat(80))?;
        writeln!(writer, "  MISSING MEMBERS")?;
        writeln!(writer, "{}", "-".repeat(80))?;
        for missing in &report.missing_members {
            writeln!(writer, "{}", missing.format_human_readable())?;
        }
        writeln!(writer)?;
    }

    writeln!(writer, "{}", "=".repeat(80))?;
    if report.ok {
        writeln!(
            writer,
            "\u{2713} All {} archive(s) contain the expected members",
            report.archives_checked
        )?;
    } else {
        if !report.archive_errors.is_empty() {
            writeln!(
                writer,
                "\u{2717} {} archive(s) could not be read",
                report.archive_errors.len()
            )?;
        }
        if !report.missing_members.is_empty() {
            writeln!(
                writer,
                "\u{2717} {} expected member(s) missing",
                report.missing_count()
            )?;
        }
    }
    writeln!(writer, "{}", "=".repeat(80))?;

    Ok(())
}
