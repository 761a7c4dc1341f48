//! Writing session records to disk

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::recording::{compact_timestamp, SessionRecord};
use crate::Result;

/// Default output file name: `<YYYYMMDD_HHMMSS>_<scenario>.json`
#[must_use]
pub fn default_output_path(scenario: &str, at: DateTime<Utc>) -> PathBuf {
    PathBuf::from(format!(
        "{}_{}.json",
        compact_timestamp(at),
        safe_file_stem(scenario)
    ))
}

/// Replace characters unsafe in file names with `_` and collapse runs
///
/// ASCII alphanumerics, `_`, `-` and Japanese/CJK letters are kept.
#[must_use]
pub fn safe_file_stem(name: &str) -> String {
    let mut stem = String::with_capacity(name.len());
    for c in name.chars() {
        let c = if is_safe_char(c) { c } else { '_' };
        if c == '_' && stem.ends_with('_') {
            continue;
        }
        stem.push(c);
    }
    stem
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || c == '_'
        || c == '-'
        || ('\u{3040}'..='\u{309F}').contains(&c)
        || ('\u{30A0}'..='\u{30FF}').contains(&c)
        || ('\u{4E00}'..='\u{9FFF}').contains(&c)
}

/// Write `record` as pretty-printed JSON
///
/// # Errors
///
/// Returns error if serialization or the write fails
pub fn write_record(record: &SessionRecord, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(record)?;
    std::fs::write(path, json)?;
    info!(
        "Wrote {} entries to {}",
        record.entries.len(),
        path.display()
    );
    Ok(())
}
