//! Registration store backed by a JSON file
//!
//! The file holds a JSON array of destinations. Disabling rewrites the whole
//! file through a temporary sibling and a rename.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};
use wh_sender::{Destination, RegistrationStore};

pub struct FileRegistrationStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRegistrationStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<Destination>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Registrations file not found, treating as empty");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()));
            }
        };

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse registrations in {}", self.path.display()))
    }

    async fn write_all(&self, destinations: &[Destination]) -> Result<()> {
        let json = serde_json::to_vec_pretty(destinations)?;
        let tmp = self.path.with_extension("json.tmp");

        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl RegistrationStore for FileRegistrationStore {
    async fn list_destinations(&self) -> Result<Vec<Destination>> {
        self.read_all().await
    }

    async fn disable_destination(&self, destination_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut destinations = self.read_all().await?;
        let destination = destinations
            .iter_mut()
            .find(|d| d.id == destination_id)
            .with_context(|| format!("destination {} is not registered", destination_id))?;

        if destination.is_paused {
            return Ok(());
        }
        destination.is_paused = true;

        self.write_all(&destinations).await?;
        info!(destination_id, "Destination paused");
        Ok(())
    }
}
