//! Servable file registry
//!
//! The set of names the server answers for is fixed at startup. A request
//! for any other name is refused before a data endpoint is opened, so a
//! client can never reach outside the root directory.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Upper bound on registry size when none is configured
pub const DEFAULT_MAX_RESOURCES: usize = 256;

/// Registered file names under one root directory
#[derive(Debug, Clone)]
pub struct FileRegistry {
    root: PathBuf,
    names: BTreeSet<String>,
}

impl FileRegistry {
    /// Register the regular files directly under `root`
    ///
    /// Subdirectories and names that are not valid UTF-8 are skipped. At
    /// most `max_entries` files are registered (in name order); the rest
    /// are logged and ignored.
    pub async fn scan(root: impl AsRef<Path>, max_entries: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut entries = tokio::fs::read_dir(&root)
            .await
            .with_context(|| format!("Failed to read root directory {}", root.display()))?;

        let mut names = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = tokio::fs::metadata(entry.path()).await?;
            if !metadata.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => {
                    names.insert(name);
                }
                Err(name) => tracing::debug!("Skipping non UTF-8 file name {:?}", name),
            }
        }

        if names.len() > max_entries {
            let skipped: Vec<_> = names.iter().skip(max_entries).cloned().collect();
            tracing::warn!(
                "{} holds {} files, only the first {} are served; skipping {:?}",
                root.display(),
                names.len(),
                max_entries,
                skipped
            );
            names = names.into_iter().take(max_entries).collect();
        }

        tracing::info!("Registered {} files from {}", names.len(), root.display());
        Ok(Self { root, names })
    }

    /// Build a registry from explicit names
    ///
    /// Each name must be a plain file name: no path separators, no `..`.
    /// The files need not exist yet (a write request may create them).
    pub fn from_names<I, S>(root: impl Into<PathBuf>, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for name in names {
            let name = name.into();
            validate_name(&name)?;
            set.insert(name);
        }
        Ok(Self {
            root: root.into(),
            names: set,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `name` may be transferred
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Path of a registered name under the root
    ///
    /// # Examples
    /// ```
    /// use tftp::FileRegistry;
    ///
    /// let registry = FileRegistry::from_names("/srv/tftp", ["boot.img"]).unwrap();
    /// assert_eq!(
    ///     registry.resolve("boot.img"),
    ///     Some(std::path::PathBuf::from("/srv/tftp/boot.img"))
    /// );
    /// assert_eq!(registry.resolve("other.img"), None);
    /// ```
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.contains(name).then(|| self.root.join(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("Empty file name");
    }
    if name.contains(['/', '\\']) {
        bail!("File name '{}' contains a path separator", name);
    }
    if name == "." || name.contains("..") {
        bail!("File name '{}' attempts directory traversal", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_scan_registers_regular_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"a").unwrap();
        std::fs::write(dir.path().join("b.bin"), b"b").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let registry = FileRegistry::scan(dir.path(), DEFAULT_MAX_RESOURCES).await.unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), ["a.bin", "b.bin"]);
        assert!(!registry.contains("subdir"));
        assert_eq!(registry.resolve("a.bin"), Some(dir.path().join("a.bin")));
        assert_eq!(registry.root(), dir.path());
    }

    #[tokio::test]
    async fn test_scan_respects_limit() {
        let dir = tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}")), b"x").unwrap();
        }

        let registry = FileRegistry::scan(dir.path(), 3).await.unwrap();
        assert_eq!(registry.len(), 3);
        assert!(registry.contains("f0"));
        assert!(!registry.contains("f4"));
    }

    #[tokio::test]
    async fn test_scan_missing_root_fails() {
        let dir = tempdir().unwrap();
        let result = FileRegistry::scan(dir.path().join("missing"), 10).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_from_names_rejects_traversal() {
        assert!(FileRegistry::from_names("/srv", ["../etc/passwd"]).is_err());
        assert!(FileRegistry::from_names("/srv", ["dir/file"]).is_err());
        assert!(FileRegistry::from_names("/srv", ["dir\\file"]).is_err());
        assert!(FileRegistry::from_names("/srv", [".."]).is_err());
        assert!(FileRegistry::from_names("/srv", [""]).is_err());

        let registry = FileRegistry::from_names("/srv", ["ok.img", "ok.img"]).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }
}
