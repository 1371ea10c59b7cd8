//! Storage for frames that triggered a detection.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

/// Persists the encoded frame behind a `FOUND` result.
pub trait ArtifactStore: Send {
    /// Store `image` and return where it was written.
    fn save(&self, job_type: &str, image: &[u8]) -> Result<PathBuf>;
}

/// Writes artifacts as `<dir>/<job_type>-<unix_millis>.jpg`, adding a
/// `-<n>` suffix when that name is taken.
#[derive(Clone, Debug)]
pub struct DiskArtifactStore {
    dir: PathBuf,
}

impl DiskArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ArtifactStore for DiskArtifactStore {
    fn save(&self, job_type: &str, image: &[u8]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create artifact dir {}", self.dir.display()))?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock before unix epoch")?
            .as_millis();
        let safe_type: String = job_type
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        write_unique(&self.dir, &format!("{}-{}", safe_type, millis), image)
    }
}

const MAX_NAME_ATTEMPTS: u32 = 1000;

fn write_unique(dir: &Path, stem: &str, image: &[u8]) -> Result<PathBuf> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = match attempt {
            0 => format!("{}.jpg", stem),
            n => format!("{}-{}.jpg", stem, n),
        };
        let path = dir.join(name);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("create artifact {}", path.display()))
            }
        };
        file.write_all(image)
            .with_context(|| format!("write artifact {}", path.display()))?;
        return Ok(path);
    }
    anyhow::bail!("no free artifact name for {} in {}", stem, dir.display())
}
