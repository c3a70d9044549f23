//! JSON document store for timers and series timers
//!
//! The whole collection is read at startup and rewritten after every change.
//! Writes go to a temporary sibling first and are renamed into place.

use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use crate::error::Result;

pub struct JsonStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    /// Read the collection. A missing file is an empty collection.
    pub async fn try_load(&self) -> Result<Vec<T>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No store at {:?}, starting empty", self.path);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read the collection, logging and discarding anything unreadable
    pub async fn load(&self) -> Vec<T> {
        match self.try_load().await {
            Ok(items) => {
                info!("Loaded {} entries from {:?}", items.len(), self.path);
                items
            }
            Err(e) => {
                error!("Failed to load {:?}, starting empty: {}", self.path, e);
                Vec::new()
            }
        }
    }

    /// Replace the stored collection
    pub async fn save(&self, items: &[T]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_vec_pretty(items)?;
        let tmp_path = self.tmp_path();

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &self.path).await?;
        debug!("Saved {} entries to {:?}", items.len(), self.path);
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
