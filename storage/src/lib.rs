pub mod format;

use citusha_common::{Result, RoleMapping};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Durable `{group -> assignment}` store.
///
/// Callers always hand over and receive the full mapping; there is no
/// per-group update.
#[async_trait::async_trait]
pub trait RoleStateStore: Send + Sync {
    /// Load the persisted mapping, or `None` on first boot
    async fn load(&self) -> Result<Option<RoleMapping>>;

    /// Replace the persisted mapping. A concurrent reader sees either the
    /// previous file or the new one, never a mix.
    async fn save(&self, mapping: &RoleMapping) -> Result<()>;
}

/// Role state kept in a single human-readable file
pub struct FileRoleStateStore {
    path: PathBuf,
    temp_path: PathBuf,
}

impl FileRoleStateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut temp_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "roles.state".into());
        temp_name.push(".tmp");
        let temp_path = path.with_file_name(temp_name);

        Self { path, temp_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file without touching it. Used by the read-only status view.
    pub async fn read_text(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl RoleStateStore for FileRoleStateStore {
    async fn load(&self) -> Result<Option<RoleMapping>> {
        let text = match self.read_text().await? {
            Some(text) => text,
            None => {
                tracing::info!("No role state at {}, first boot", self.path.display());
                return Ok(None);
            }
        };

        let mapping = format::decode(&text)?;
        tracing::debug!(
            "Loaded role state for {} groups from {}",
            mapping.len(),
            self.path.display()
        );

        Ok(Some(mapping))
    }

    async fn save(&self, mapping: &RoleMapping) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);

        if let Some(parent) = &parent {
            fs::create_dir_all(parent).await?;
        }

        let content = format::encode(mapping);

        // Write to temp, fsync, then rename over the live file
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.temp_path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&self.temp_path, &self.path).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(e.into());
        }

        // Make the rename itself durable
        #[cfg(unix)]
        {
            if let Some(parent) = &parent {
                if let Ok(dir) = fs::File::open(parent).await {
                    let _ = dir.sync_all().await;
                }
            }
        }

        tracing::debug!(
            "Saved role state for {} groups to {}",
            mapping.len(),
            self.path.display()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_path_is_sibling() {
        let store = FileRoleStateStore::new("/var/lib/citusha/roles.state");
        assert_eq!(store.temp_path, PathBuf::from("/var/lib/citusha/roles.state.tmp"));
        assert_eq!(store.path(), Path::new("/var/lib/citusha/roles.state"));
    }

    #[tokio::test]
    async fn test_missing_file_is_first_boot() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileRoleStateStore::new(temp_dir.path().join("roles.state"));

        assert!(store.load().await.unwrap().is_none());
        assert!(store.read_text().await.unwrap().is_none());
    }
}
