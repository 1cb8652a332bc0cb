use crate::error::{Error, Result, ResultIoExt};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Opaque key→bytes backend. Keys are hierarchical, `/`-separated, and
/// always interpreted relative to the backend's root.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Atomically replace the content at `key`, creating intermediate
    /// directories as needed.
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Names of the entries directly under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Validate a single key component to prevent directory traversal attacks
fn validate_key_component(key: &str, component: &str) -> Result<()> {
    if component == "." || component == ".." {
        return Err(Error::InvalidPath {
            path: key.to_string(),
        });
    }

    if component.contains('\\') || component.contains('\0') {
        return Err(Error::InvalidPath {
            path: key.to_string(),
        });
    }

    Ok(())
}

/// Split a key into validated components. Leading slashes and empty
/// segments are dropped, so `/a//b` and `a/b` name the same entry.
fn key_components(key: &str) -> Result<Vec<&str>> {
    let components: Vec<&str> = key.split('/').filter(|c| !c.is_empty()).collect();
    for component in &components {
        validate_key_component(key, component)?;
    }
    Ok(components)
}

/// Check that `key` names a file inside the storage root: at least one
/// component and no traversal.
pub fn validate_key(key: &str) -> Result<()> {
    if key_components(key)?.is_empty() {
        return Err(Error::InvalidPath {
            path: key.to_string(),
        });
    }
    Ok(())
}

/// Local filesystem implementation of [`BlobStore`], rooted at a single
/// directory. Replacement is atomic: data is written to a temp file in the
/// destination directory, fsynced, then renamed over the target.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a file key to an absolute path under the root.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let components = key_components(key)?;
        if components.is_empty() {
            return Err(Error::InvalidPath {
                path: key.to_string(),
            });
        }

        let mut path = self.root.clone();
        for component in components {
            path.push(component);
        }
        Ok(path)
    }

    /// Resolve a directory prefix; unlike [`resolve`] the empty key is
    /// allowed and names the root itself.
    fn resolve_dir(&self, prefix: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for component in key_components(prefix)? {
            path.push(component);
        }
        Ok(path)
    }
}

/// Apply a unix mode explicitly, so stored entries carry 0755/0644
/// regardless of the process umask.
#[cfg(unix)]
async fn set_mode(path: &std::path::Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_io_err(path)
}

#[cfg(not(unix))]
async fn set_mode(_path: &std::path::Path, _mode: u32) -> Result<()> {
    Ok(())
}

impl LocalStore {
    /// Create every missing directory from the root down to `parent`,
    /// mode 0755 each.
    async fn create_dirs(&self, key: &str, parent: &std::path::Path) -> Result<()> {
        let mut current = self.root.clone();
        if !fs::try_exists(&current).await.map_io_err(&current)? {
            fs::create_dir_all(&current).await.map_io_err(&current)?;
            set_mode(&current, 0o755).await?;
        }

        let relative = parent
            .strip_prefix(&self.root)
            .map_err(|_| Error::InvalidPath {
                path: key.to_string(),
            })?;

        for component in relative.components() {
            current.push(component);
            match fs::create_dir(&current).await {
                Ok(()) => set_mode(&current, 0o755).await?,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(Error::Io {
                        error: e,
                        path: current.display().to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let dest = self.resolve(key)?;

        let parent = dest.parent().ok_or_else(|| Error::InvalidPath {
            path: key.to_string(),
        })?;
        self.create_dirs(key, parent).await?;

        // Write-to-temp-then-rename so readers never observe a torn file.
        // The mode goes on the temp file so the blob lands as 0644.
        let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&tmp).await.map_io_err(&tmp)?;
        file.write_all(data).await.map_io_err(&tmp)?;
        file.sync_all().await.map_io_err(&tmp)?;
        drop(file);
        set_mode(&tmp, 0o644).await?;

        if let Err(e) = fs::rename(&tmp, &dest).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::Io {
                error: e,
                path: dest.display().to_string(),
            });
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;

        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound {
                path: key.to_string(),
            }),
            Err(e) => Err(Error::Io {
                error: e,
                path: path.display().to_string(),
            }),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        Ok(fs::try_exists(&path).await.map_io_err(&path)?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve_dir(prefix)?;

        if !dir.is_dir() {
            return Err(Error::NotFound {
                path: prefix.to_string(),
            });
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&dir).await.map_io_err(&dir)?;
        while let Some(entry) = entries.next_entry().await.map_io_err(&dir)? {
            if let Some(name) = entry.file_name().to_str() {
                // Skip temp files left behind by an interrupted put
                if name.starts_with('.') && name.ends_with(".tmp") {
                    continue;
                }
                names.push(name.to_string());
            }
        }
        names.sort();

        Ok(names)
    }
}
