//! Adapter registry
//!
//! Maps platforms to adapter factories plus optional platform-wide receive
//! services. `init_all`/`shutdown_all` bracket the process lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use crate::adapters::Adapter;
use crate::models::{ContactId, Platform, UserId};

/// Platform-wide lifecycle hooks (receive loops, queue teardown).
#[async_trait]
pub trait PlatformService: Send + Sync {
    async fn start_all(&self) -> Result<()>;
    async fn stop_all(&self);
}

pub type AdapterFactory =
    Arc<dyn Fn(UserId, ContactId) -> Result<Arc<dyn Adapter>> + Send + Sync>;

pub struct AdapterEntry {
    pub platform: Platform,
    pub factory: AdapterFactory,
    pub service: Option<Arc<dyn PlatformService>>,
}

#[derive(Default)]
pub struct AdapterRegistry {
    entries: RwLock<HashMap<Platform, AdapterEntry>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entry: AdapterEntry) {
        info!("adapter registered platform={}", entry.platform);
        self.entries.write().insert(entry.platform, entry);
    }

    pub fn supports(&self, platform: Platform) -> bool {
        self.entries.read().contains_key(&platform)
    }

    pub fn create(&self, platform: Platform, user_id: UserId, contact_id: ContactId) -> Result<Arc<dyn Adapter>> {
        let entries = self.entries.read();
        let Some(entry) = entries.get(&platform) else {
            bail!("no adapter registered for platform={platform}");
        };
        (entry.factory)(user_id, contact_id)
    }

    /// Start platform-wide receive services. Called once at process start.
    pub async fn init_all(&self) -> Result<()> {
        let services: Vec<(Platform, Arc<dyn PlatformService>)> = self
            .entries
            .read()
            .values()
            .filter_map(|e| e.service.clone().map(|s| (e.platform, s)))
            .collect();
        for (platform, service) in services {
            info!("adapter start_all platform={}", platform);
            service.start_all().await?;
        }
        Ok(())
    }

    /// Stop platform-wide receive services. Called once at process stop.
    pub async fn shutdown_all(&self) {
        let services: Vec<(Platform, Arc<dyn PlatformService>)> = self
            .entries
            .read()
            .values()
            .filter_map(|e| e.service.clone().map(|s| (e.platform, s)))
            .collect();
        for (platform, service) in services {
            info!("adapter stop_all platform={}", platform);
            service.stop_all().await;
        }
    }
}
