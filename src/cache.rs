use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use walkdir::WalkDir;

/// Free-space fraction of the volume holding a path.
pub trait SpaceProbe {
    fn free_fraction(&self, path: &Path) -> io::Result<f64>;
}

/// [`SpaceProbe`] backed by the filesystem's own statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct VolumeSpace;

impl SpaceProbe for VolumeSpace {
    fn free_fraction(&self, path: &Path) -> io::Result<f64> {
        let total = fs2::total_space(path)?;
        if total == 0 {
            return Ok(1.0);
        }
        let available = fs2::available_space(path)?;
        Ok(available as f64 / total as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub dir: PathBuf,
    #[serde(default = "default_free_threshold")]
    pub free_threshold: f64,
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: u64,
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
}

fn default_free_threshold() -> f64 {
    0.15
}

fn default_retention_minutes() -> u64 {
    30
}

fn default_patterns() -> Vec<String> {
    vec!["*.dcm".to_string(), "*.nii.gz".to_string()]
}

impl CacheSettings {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            free_threshold: default_free_threshold(),
            retention_minutes: default_retention_minutes(),
            patterns: default_patterns(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionReport {
    pub files_deleted: usize,
    pub bytes_freed: u64,
}

impl EvictionReport {
    pub fn merge(&mut self, other: EvictionReport) {
        self.files_deleted += other.files_deleted;
        self.bytes_freed += other.bytes_freed;
    }
}

/// Opportunistic, best-effort eviction of cached image files.
pub struct CacheGuardian {
    settings: CacheSettings,
    patterns: Vec<Pattern>,
    probe: Box<dyn SpaceProbe>,
}

impl CacheGuardian {
    pub fn new(settings: CacheSettings) -> Self {
        Self::with_probe(settings, Box::new(VolumeSpace))
    }

    pub fn with_probe(settings: CacheSettings, probe: Box<dyn SpaceProbe>) -> Self {
        let patterns = settings
            .patterns
            .iter()
            .filter_map(|glob| match Pattern::new(glob) {
                Ok(p) => Some(p),
                Err(e) => {
                    error!("Invalid cache pattern '{}': {}", glob, e);
                    None
                }
            })
            .collect();
        Self {
            settings,
            patterns,
            probe,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.settings.dir
    }

    /// Evict old image files when free space is at or below the threshold.
    /// Called once per session.
    pub fn check_and_free(&self) -> EvictionReport {
        let dir = &self.settings.dir;
        if !dir.is_dir() {
            return EvictionReport::default();
        }
        let free = match self.probe.free_fraction(dir) {
            Ok(free) => free,
            Err(e) => {
                error!("Error reading free space of {}: {}", dir.display(), e);
                return EvictionReport::default();
            }
        };
        debug!("{:.1}% free on the volume holding {}", free * 100.0, dir.display());
        if free > self.settings.free_threshold {
            return EvictionReport::default();
        }

        let retention = Duration::from_secs(self.settings.retention_minutes * 60);
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let report = self.delete_matching(|modified| modified <= cutoff);
        info!(
            "Low disk space in cache {}: deleted {} files ({} bytes)",
            dir.display(),
            report.files_deleted,
            report.bytes_freed
        );
        report
    }

    /// Remove every cached image file regardless of age.
    pub fn clear(&self) -> EvictionReport {
        let report = self.delete_matching(|_| true);
        info!(
            "Cleared cache {}: {} files",
            self.settings.dir.display(),
            report.files_deleted
        );
        report
    }

    fn is_image(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        self.patterns.iter().any(|pattern| pattern.matches(name))
    }

    fn delete_matching<F>(&self, expired: F) -> EvictionReport
    where
        F: Fn(SystemTime) -> bool,
    {
        let mut report = EvictionReport::default();
        for entry in WalkDir::new(&self.settings.dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() || !self.is_image(path) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    error!("Error reading metadata for {}: {}", path.display(), e);
                    continue;
                }
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if !expired(modified) {
                continue;
            }
            match fs::remove_file(path) {
                Ok(()) => {
                    report.files_deleted += 1;
                    report.bytes_freed += metadata.len();
                }
                Err(e) => error!("Error deleting {}: {}", path.display(), e),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct FixedSpace(f64);

    impl SpaceProbe for FixedSpace {
        fn free_fraction(&self, _path: &Path) -> io::Result<f64> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_no_eviction_with_enough_space() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.dcm"), b"x").unwrap();
        let guardian = CacheGuardian::with_probe(
            CacheSettings {
                retention_minutes: 0,
                ..CacheSettings::new(dir.path())
            },
            Box::new(FixedSpace(0.5)),
        );
        assert_eq!(guardian.check_and_free(), EvictionReport::default());
        assert!(dir.path().join("a.dcm").exists());
    }

    #[test]
    fn test_clear_only_touches_image_files() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("a.dcm"), b"abc").unwrap();
        fs::write(dir.path().join("nested/b.nii.gz"), b"de").unwrap();
        fs::write(dir.path().join("keep.txt"), b"x").unwrap();

        let guardian = CacheGuardian::with_probe(
            CacheSettings::new(dir.path()),
            Box::new(FixedSpace(0.9)),
        );
        let report = guardian.clear();
        assert_eq!(report.files_deleted, 2);
        assert_eq!(report.bytes_freed, 5);
        assert!(dir.path().join("keep.txt").exists());
    }

    #[test]
    fn test_missing_cache_dir_is_ignored() {
        let guardian = CacheGuardian::with_probe(
            CacheSettings::new("/definitely/not/here"),
            Box::new(FixedSpace(0.0)),
        );
        assert_eq!(guardian.check_and_free(), EvictionReport::default());
    }
}
