//! On-disk bare-mirror store.
//!
//! Mirrors live at `{root}/{fingerprint}.git`; the fingerprint's `/`
//! separators become nested directories, so `github.com/octo/demo` is
//! stored at `{root}/github.com/octo/demo.git`. A directory counts as a
//! mirror iff it contains a `HEAD` file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::debug;

use crate::fingerprint::Fingerprint;

/// One mirror discovered by walking the store.
#[derive(Debug, Clone)]
pub struct MirrorEntry {
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
    /// mtime of `HEAD`, falling back to the directory mtime, then epoch.
    pub modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct MirrorStore {
    root: PathBuf,
}

impl MirrorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk path for a fingerprint: `{root}/{fingerprint}.git`.
    pub fn resolve(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(format!("{}.git", fingerprint.as_str()))
    }

    /// A mirror exists iff its directory holds a readable `HEAD` file.
    pub fn exists(&self, fingerprint: &Fingerprint) -> bool {
        self.resolve(fingerprint).join("HEAD").is_file()
    }

    /// Walk the store and return every mirror found.
    ///
    /// Descent stops at a mirror directory (its internals are opaque to the
    /// store) and unreadable subtrees are silently skipped.
    pub fn list(&self) -> Vec<MirrorEntry> {
        let mut found = Vec::new();
        if !self.root.exists() {
            return found;
        }

        let mut stack = vec![self.root.clone()];
        while let Some(current) = stack.pop() {
            let entries = match fs::read_dir(&current) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else { continue };
                if !meta.is_dir() {
                    continue;
                }
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "git")
                    && path.join("HEAD").is_file()
                {
                    let Some(fingerprint) = self.fingerprint_for(&path) else {
                        continue;
                    };
                    let modified = mirror_mtime(&path);
                    found.push(MirrorEntry {
                        fingerprint,
                        path,
                        modified,
                    });
                    continue;
                }
                stack.push(path);
            }
        }

        found
    }

    /// Recursively remove a mirror, then remove any now-empty parent
    /// directories, stopping before the store root.
    pub async fn delete(&self, fingerprint: &Fingerprint) -> Result<()> {
        let path = self.resolve(fingerprint);
        tokio::fs::remove_dir_all(&path)
            .await
            .with_context(|| format!("failed to remove mirror at {}", path.display()))?;
        debug!(repo = %fingerprint, path = %path.display(), "mirror removed");
        self.clean_empty_parents(&path);
        Ok(())
    }

    fn clean_empty_parents(&self, path: &Path) {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root || d == Path::new("/") || d.as_os_str().is_empty() {
                break;
            }
            match fs::read_dir(d) {
                Ok(mut entries) => {
                    if entries.next().is_some() {
                        break;
                    }
                }
                Err(_) => break,
            }
            if fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }

    fn fingerprint_for(&self, path: &Path) -> Option<Fingerprint> {
        let rel = path.strip_prefix(&self.root).ok()?.to_str()?;
        Fingerprint::parse(rel).ok()
    }
}

/// mtime of a mirror, preferring `HEAD` over the directory itself.
fn mirror_mtime(path: &Path) -> SystemTime {
    fs::metadata(path.join("HEAD"))
        .or_else(|_| fs::metadata(path))
        .and_then(|meta| meta.modified())
        .unwrap_or(UNIX_EPOCH)
}

/// Total size of all regular files under `dir`; unreadable entries are
/// skipped.
pub fn dir_size(dir: &Path) -> u64 {
    let mut total: u64 = 0;
    if !dir.exists() {
        return 0;
    }

    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }

    total
}
