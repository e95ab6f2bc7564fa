//! Content index over the on-disk tree:
//! `root/<YYYY-MM>/<destination>/<category>/<file>`.
//!
//! Deliberately lazy and uncached: submissions and deletions happen
//! concurrently with scheduling, so every call reads current storage state.
use crate::config::Destination;
use crate::model::Asset;
use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

static PERIOD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}$").unwrap());

/// Metadata file a packaging tool may leave in a period directory; it does
/// not keep an otherwise-empty period alive.
const PACKAGE_METADATA: &str = "package_info.json";

/// Per-destination asset counts.
#[derive(Debug, Clone, Default)]
pub struct DestinationCounts {
    pub total: usize,
    pub categories: BTreeMap<String, usize>,
}

#[derive(Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Period directories (`YYYY-MM`) under the root, sorted by name.
    fn period_dirs(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter(|e| PERIOD_RE.is_match(&e.file_name().to_string_lossy()))
            .map(|e| e.path())
            .collect();
        dirs.sort();
        dirs
    }

    /// Enumerate every asset under every category and period of one
    /// destination. `formats` are dotted lowercase-insensitive extensions.
    pub fn list_assets(&self, dest: &Destination, formats: &[String]) -> Result<Vec<Asset>> {
        let mut assets = Vec::new();
        for period in self.period_dirs() {
            let dest_dir = period.join(&dest.id);
            if !dest_dir.is_dir() {
                continue;
            }
            for cat_entry in fs::read_dir(&dest_dir)
                .with_context(|| format!("reading {}", dest_dir.display()))?
                .flatten()
            {
                let cat_dir = cat_entry.path();
                if !cat_dir.is_dir() {
                    continue;
                }
                let category = cat_entry.file_name().to_string_lossy().to_string();
                let hashtag = dest
                    .categories
                    .iter()
                    .find(|c| c.folder == category)
                    .and_then(|c| c.hashtags.first().cloned());
                for file_entry in fs::read_dir(&cat_dir)
                    .with_context(|| format!("reading {}", cat_dir.display()))?
                    .flatten()
                {
                    let path = file_entry.path();
                    if !path.is_file() {
                        continue;
                    }
                    if !matches_format(&file_entry.file_name().to_string_lossy(), formats) {
                        continue;
                    }
                    assets.push(Asset {
                        path,
                        destination: dest.id.clone(),
                        category: category.clone(),
                        hashtag: hashtag.clone(),
                    });
                }
            }
        }
        Ok(assets)
    }

    /// Store raw bytes under the current period, never overwriting: an
    /// occupied name gets a numeric suffix before the extension.
    pub fn write(
        &self,
        dest_id: &str,
        category: &str,
        bytes: &[u8],
        suggested_name: &str,
    ) -> Result<PathBuf> {
        let period = Utc::now().format("%Y-%m").to_string();
        let dir = self.root.join(period).join(dest_id).join(category);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let name = unique_name(&dir, suggested_name);
        let path = dir.join(name);
        fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "stored submission");
        Ok(path)
    }

    /// Remove now-empty category directories, then empty destination
    /// directories, then period directories holding nothing but package
    /// metadata. Never touches a directory that still contains assets.
    pub fn cleanup_empty(&self) -> Result<usize> {
        let mut removed = 0;
        for period in self.period_dirs() {
            for dest_entry in fs::read_dir(&period)?.flatten() {
                let dest_dir = dest_entry.path();
                if !dest_dir.is_dir() {
                    continue;
                }
                for cat_entry in fs::read_dir(&dest_dir)?.flatten() {
                    let cat_dir = cat_entry.path();
                    if cat_dir.is_dir() && dir_is_empty(&cat_dir)? {
                        fs::remove_dir(&cat_dir)?;
                        removed += 1;
                        debug!(dir = %cat_dir.display(), "removed empty category dir");
                    }
                }
                if dir_is_empty(&dest_dir)? {
                    fs::remove_dir(&dest_dir)?;
                    removed += 1;
                    debug!(dir = %dest_dir.display(), "removed empty destination dir");
                }
            }
            let remaining: Vec<PathBuf> = fs::read_dir(&period)?
                .flatten()
                .map(|e| e.path())
                .collect();
            let only_metadata = remaining.len() == 1
                && remaining[0]
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy() == PACKAGE_METADATA);
            if remaining.is_empty() || only_metadata {
                for file in remaining {
                    fs::remove_file(file)?;
                }
                fs::remove_dir(&period)?;
                removed += 1;
                debug!(dir = %period.display(), "removed empty period dir");
            }
        }
        if removed > 0 {
            info!(removed, "cleaned up empty content directories");
        }
        Ok(removed)
    }

    /// Asset counts for one destination, aggregated across periods.
    pub fn counts(&self, dest: &Destination, formats: &[String]) -> DestinationCounts {
        let mut out = DestinationCounts::default();
        let Ok(assets) = self.list_assets(dest, formats) else {
            return out;
        };
        for asset in assets {
            *out.categories.entry(asset.category).or_insert(0) += 1;
            out.total += 1;
        }
        out
    }

    /// `period/category -> count` breakdown used in failure diagnostics.
    pub fn folder_counts(&self, dest_id: &str, formats: &[String]) -> Vec<(String, usize)> {
        let mut out = Vec::new();
        for period in self.period_dirs() {
            let period_name = period
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let dest_dir = period.join(dest_id);
            if !dest_dir.is_dir() {
                continue;
            }
            let Ok(entries) = fs::read_dir(&dest_dir) else {
                continue;
            };
            for cat_entry in entries.flatten() {
                let cat_dir = cat_entry.path();
                if !cat_dir.is_dir() {
                    continue;
                }
                let Ok(files) = fs::read_dir(&cat_dir) else {
                    continue;
                };
                let count = files
                    .flatten()
                    .filter(|f| f.path().is_file())
                    .filter(|f| matches_format(&f.file_name().to_string_lossy(), formats))
                    .count();
                if count > 0 {
                    let cat_name = cat_entry.file_name().to_string_lossy().to_string();
                    out.push((format!("{period_name}/{cat_name}"), count));
                }
            }
        }
        out
    }
}

fn matches_format(name: &str, formats: &[String]) -> bool {
    let lower = name.to_lowercase();
    formats.iter().any(|ext| lower.ends_with(&ext.to_lowercase()))
}

fn dir_is_empty(dir: &Path) -> Result<bool> {
    Ok(fs::read_dir(dir)?.next().is_none())
}

/// Deterministic collision avoidance: `name.ext`, `name_1.ext`, `name_2.ext`, ...
fn unique_name(dir: &Path, suggested: &str) -> String {
    if !dir.join(suggested).exists() {
        return suggested.to_string();
    }
    let path = Path::new(suggested);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| suggested.to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut c = 1;
    loop {
        let candidate = format!("{stem}_{c}{ext}");
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        c += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Category, Destination};
    use tempfile::tempdir;

    fn dest(id: &str) -> Destination {
        Destination {
            id: id.to_string(),
            name: id.to_string(),
            chat_id: "-100123".to_string(),
            enabled: true,
            categories: vec![Category {
                folder: "Forest".to_string(),
                hashtags: vec!["#forest".to_string(), "#woods".to_string()],
            }],
        }
    }

    fn formats() -> Vec<String> {
        vec![".jpg".to_string(), ".mp4".to_string()]
    }

    #[test]
    fn write_then_list_roundtrip() {
        let td = tempdir().unwrap();
        let store = ContentStore::new(td.path());
        store.write("nature", "Forest", b"img", "a.jpg").unwrap();

        let assets = store.list_assets(&dest("nature"), &formats()).unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].category, "Forest");
        assert_eq!(assets[0].hashtag.as_deref(), Some("#forest"));
    }

    #[test]
    fn unsupported_formats_are_ignored() {
        let td = tempdir().unwrap();
        let store = ContentStore::new(td.path());
        store.write("nature", "Forest", b"img", "a.jpg").unwrap();
        store.write("nature", "Forest", b"txt", "notes.txt").unwrap();

        let assets = store.list_assets(&dest("nature"), &formats()).unwrap();
        assert_eq!(assets.len(), 1);
    }

    #[test]
    fn collision_avoidance_never_overwrites() {
        let td = tempdir().unwrap();
        let store = ContentStore::new(td.path());
        let first = store.write("nature", "Forest", b"one", "a.jpg").unwrap();
        let second = store.write("nature", "Forest", b"two", "a.jpg").unwrap();
        let third = store.write("nature", "Forest", b"three", "a.jpg").unwrap();

        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(fs::read(&first).unwrap(), b"one");
        assert_eq!(fs::read(&second).unwrap(), b"two");
        assert!(second.to_string_lossy().ends_with("a_1.jpg"));
        assert!(third.to_string_lossy().ends_with("a_2.jpg"));
    }

    #[test]
    fn cleanup_removes_empty_tree_but_keeps_assets() {
        let td = tempdir().unwrap();
        let store = ContentStore::new(td.path());
        let kept = store.write("nature", "Forest", b"img", "keep.jpg").unwrap();
        fs::create_dir_all(td.path().join("2026-01/city/Night")).unwrap();

        let removed = store.cleanup_empty().unwrap();
        assert!(removed >= 3); // category, destination, period
        assert!(kept.exists());
        assert!(!td.path().join("2026-01").exists());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let td = tempdir().unwrap();
        let store = ContentStore::new(td.path());
        fs::create_dir_all(td.path().join("2026-01/city/Night")).unwrap();

        assert!(store.cleanup_empty().unwrap() > 0);
        assert_eq!(store.cleanup_empty().unwrap(), 0);
        assert_eq!(store.cleanup_empty().unwrap(), 0);
    }

    #[test]
    fn metadata_only_period_is_removed() {
        let td = tempdir().unwrap();
        let store = ContentStore::new(td.path());
        let period = td.path().join("2026-02");
        fs::create_dir_all(&period).unwrap();
        fs::write(period.join(PACKAGE_METADATA), "{}").unwrap();

        store.cleanup_empty().unwrap();
        assert!(!period.exists());
    }

    #[test]
    fn counts_aggregate_across_periods() {
        let td = tempdir().unwrap();
        let store = ContentStore::new(td.path());
        // Two periods with files for the same destination.
        for period in ["2026-01", "2026-02"] {
            let dir = td.path().join(period).join("nature/Forest");
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("x.jpg"), b"img").unwrap();
        }

        let counts = store.counts(&dest("nature"), &formats());
        assert_eq!(counts.total, 2);
        assert_eq!(counts.categories.get("Forest"), Some(&2));

        let folders = store.folder_counts("nature", &formats());
        assert_eq!(folders.len(), 2);
        assert_eq!(folders[0], ("2026-01/Forest".to_string(), 1));
    }
}
