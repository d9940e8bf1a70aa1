// ABOUTME: Staged-file naming: date-partitioned export paths and import-side discovery
// ABOUTME: Renders {table}/{ts} templates and falls back to the newest matching snapshot

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const TABLE_PLACEHOLDER: &str = "{table}";
pub const TS_PLACEHOLDER: &str = "{ts}";

/// Format of the date-partition directory
pub const DATE_FORMAT: &str = "%Y%m%d";
/// Format of `{ts}` on export: UTC, millisecond resolution
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3f";

/// A template must name both placeholders and keep `{ts}` in the file name
pub fn validate_template(template: &str) -> Result<()> {
    if !template.contains(TABLE_PLACEHOLDER) || !template.contains(TS_PLACEHOLDER) {
        bail!(
            "dump_path '{}' must contain both {{table}} and {{ts}} placeholders",
            template
        );
    }

    let (_, basename) = split_template(template)?;
    if !basename.contains(TS_PLACEHOLDER) {
        bail!(
            "dump_path '{}' must use {{ts}} in the file name, not in a directory",
            template
        );
    }

    Ok(())
}

/// The date partition an import's `as_of` points at: its first eight characters
/// as `YYYYMMDD`
pub fn date_partition_for(as_of: &str) -> Result<String> {
    let prefix = as_of
        .get(..8)
        .with_context(|| format!("as_of '{}' must start with a YYYYMMDD date", as_of))?;

    NaiveDate::parse_from_str(prefix, DATE_FORMAT)
        .with_context(|| format!("as_of '{}' must start with a YYYYMMDD date", as_of))?;

    Ok(prefix.to_string())
}

/// Where an export of `table` writes its snapshot
///
/// The date directory comes from the job's start time so that every table of one
/// job lands in the same partition, while `{ts}` is taken per table.
pub fn export_path(
    template: &str,
    table: &str,
    job_started: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    let (parent, basename) = split_template(template)?;
    let date_dir = job_started.format(DATE_FORMAT).to_string();
    let ts = now.format(TIMESTAMP_FORMAT).to_string();

    let file = basename
        .replace(TABLE_PLACEHOLDER, table)
        .replace(TS_PLACEHOLDER, &ts);

    Ok(render_parent(&parent, table).join(date_dir).join(file))
}

/// Locations an import of one table looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportLocation {
    /// The file named exactly by the template, `as_of` and the partition
    pub exact: PathBuf,
    /// The partition the import is aimed at
    pub date_dir: PathBuf,
    /// Directory holding every date partition
    pub root: PathBuf,
    /// Template file name with `{table}` substituted, split at each `{ts}`
    pattern: Vec<String>,
    /// Set by `as_of`: only the targeted partition is searched
    pinned: bool,
}

/// Work out where the snapshot for `table` should be
///
/// `{ts}` is `as_of` verbatim when given, otherwise today's date.
pub fn import_location(
    template: &str,
    table: &str,
    as_of: Option<&str>,
    today: NaiveDate,
) -> Result<ImportLocation> {
    let (parent, basename) = split_template(template)?;

    let (ts, partition) = match as_of {
        Some(as_of) => (as_of.to_string(), date_partition_for(as_of)?),
        None => {
            let day = today.format(DATE_FORMAT).to_string();
            (day.clone(), day)
        }
    };

    let root = render_parent(&parent, table);
    let date_dir = root.join(&partition);
    let with_table = basename.replace(TABLE_PLACEHOLDER, table);
    let exact = date_dir.join(with_table.replace(TS_PLACEHOLDER, &ts));
    let pattern = with_table
        .split(TS_PLACEHOLDER)
        .map(str::to_string)
        .collect();

    Ok(ImportLocation {
        exact,
        date_dir,
        root,
        pattern,
        pinned: as_of.is_some(),
    })
}

impl ImportLocation {
    /// Whether a file name fits the template with a timestamp in place of `{ts}`
    pub fn matches(&self, file_name: &str) -> bool {
        matches_segments(file_name, &self.pattern)
    }

    /// Directory the fallback search covers
    pub fn search_dir(&self) -> &Path {
        if self.pinned {
            &self.date_dir
        } else {
            &self.root
        }
    }

    /// Find the snapshot to import
    ///
    /// The exact path wins. Otherwise the newest matching file (by modification
    /// time) in the targeted partition. Without `as_of`, the newest across all
    /// partitions comes last. `Ok(None)` means nothing staged for this table.
    pub fn resolve(&self) -> Result<Option<PathBuf>> {
        if self.exact.is_file() {
            return Ok(Some(self.exact.clone()));
        }

        if let Some((path, _)) = self.newest_in(&self.date_dir)? {
            tracing::warn!(
                "⚠ {} not found, using newest snapshot in the same partition: {}",
                self.exact.display(),
                path.display()
            );
            return Ok(Some(path));
        }

        if self.pinned || !self.root.is_dir() {
            return Ok(None);
        }

        let mut newest: Option<(PathBuf, SystemTime)> = None;
        let entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list {}", self.root.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(candidate) = self.newest_in(&entry.path())? {
                if newest.as_ref().map(|(_, t)| candidate.1 > *t).unwrap_or(true) {
                    newest = Some(candidate);
                }
            }
        }

        if let Some((path, _)) = &newest {
            tracing::warn!(
                "⚠ {} not found, using newest snapshot from another partition: {}",
                self.exact.display(),
                path.display()
            );
        }

        Ok(newest.map(|(path, _)| path))
    }

    fn newest_in(&self, dir: &Path) -> Result<Option<(PathBuf, SystemTime)>> {
        if !dir.is_dir() {
            return Ok(None);
        }

        let mut newest: Option<(PathBuf, SystemTime)> = None;
        let entries =
            std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))?;

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !entry.file_type()?.is_file() || !self.matches(name) {
                continue;
            }

            let modified = entry.metadata()?.modified()?;
            if newest.as_ref().map(|(_, t)| modified > *t).unwrap_or(true) {
                newest = Some((entry.path(), modified));
            }
        }

        Ok(newest)
    }
}

fn split_template(template: &str) -> Result<(PathBuf, String)> {
    let path = Path::new(template);
    let basename = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("dump_path '{}' has no file name", template))?
        .to_string();
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok((parent, basename))
}

fn render_parent(parent: &Path, table: &str) -> PathBuf {
    PathBuf::from(parent.to_string_lossy().replace(TABLE_PLACEHOLDER, table))
}

/// Match `name` against the template pieces, with a timestamp in every gap
///
/// A gap has to read as `YYYYMMDD` optionally followed by `T` and digits, so
/// `location_{ts}.json` never picks up `location_history_20250101.json`.
fn matches_segments(name: &str, segments: &[String]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return name.is_empty();
    };
    let Some(remainder) = name.strip_prefix(first.as_str()) else {
        return false;
    };
    if rest.is_empty() {
        return remainder.is_empty();
    }

    remainder
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(remainder.len()))
        .any(|end| is_timestamp(&remainder[..end]) && matches_segments(&remainder[end..], rest))
}

fn is_timestamp(text: &str) -> bool {
    let Some(date) = text.get(..8) else {
        return false;
    };
    if NaiveDate::parse_from_str(date, DATE_FORMAT).is_err() {
        return false;
    }

    match &text[8..] {
        "" => true,
        time => time
            .strip_prefix('T')
            .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())),
    }
}
