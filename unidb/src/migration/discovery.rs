//! Finding and ordering migration scripts on disk

use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{DiscoveryError, Result};
use crate::migration::Migration;

static MIGRATION_STEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<version>\d+)__(?P<description>.+)$").expect("migration name pattern")
});

/// Split a file name into `(version, description)`.
///
/// The extension must already match; it is stripped here.
pub fn parse_file_name(
    file_name: &str,
    extension: &str,
) -> std::result::Result<(u64, String), DiscoveryError> {
    let invalid = |reason: &str| DiscoveryError::InvalidFilename {
        file: file_name.to_string(),
        reason: reason.to_string(),
    };

    let suffix = format!(".{}", extension);
    let stem = file_name
        .strip_suffix(&suffix)
        .ok_or_else(|| invalid("unexpected extension"))?;

    let Some(captures) = MIGRATION_STEM.captures(stem) else {
        return Err(if stem.contains("__") {
            invalid("version prefix must be a non-negative integer")
        } else {
            invalid("expected `<version>__<description>`")
        });
    };

    let version = captures["version"]
        .parse::<u64>()
        .map_err(|_| invalid("version is out of range"))?;

    Ok((version, captures["description"].to_string()))
}

/// Scan `dir` (not recursively) for `<version>__<description>.<extension>`
/// files. One bad name fails the whole scan. The result is ordered.
pub fn discover(dir: impl AsRef<Path>, extension: &str) -> Result<Vec<Migration>> {
    let dir = dir.as_ref();
    let unreadable = |path: &Path, message: String| DiscoveryError::UnreadableDirectory {
        path: path.display().to_string(),
        message,
    };

    if !dir.is_dir() {
        return Err(unreadable(dir, "not a directory".to_string()).into());
    }

    let mut migrations = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| unreadable(dir, e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy().into_owned();
        let (version, description) = parse_file_name(&file_name, extension)?;
        let script = fs::read_to_string(path).map_err(|e| unreadable(path, e.to_string()))?;

        debug!(version, file = %file_name, "Discovered migration");
        let mut migration = Migration::new(version, description, script);
        migration.file_name = file_name;
        migrations.push(migration);
    }

    Ok(order(migrations)?)
}

/// Sort strictly ascending by version. Two scripts with the same version
/// are an error rather than an arbitrary order.
pub fn order(mut migrations: Vec<Migration>) -> std::result::Result<Vec<Migration>, DiscoveryError> {
    migrations.sort_by_key(|m| m.version);

    if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
        let (mut first, mut second) = (pair[0].file_name.clone(), pair[1].file_name.clone());
        if second < first {
            std::mem::swap(&mut first, &mut second);
        }
        return Err(DiscoveryError::DuplicateVersion {
            version: pair[0].version,
            first,
            second,
        });
    }

    Ok(migrations)
}
