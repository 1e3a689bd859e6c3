//! Adapter registration
//!
//! Builds the process-wide registry from the configuration: one entry per
//! enabled platform, each with its factory and (where the platform has a
//! long-lived receive engine) its lifecycle hooks. Credential problems
//! surface when a factory runs, refusing to start that session.

use std::sync::Arc;

use crate::adapters::mock::MockAdapter;
use crate::adapters::registry::{AdapterEntry, AdapterRegistry, PlatformService};
use crate::adapters::signal::{SignalAdapter, SignalReceiptService, SignalRestClient};
use crate::adapters::whatsapp::{WhatsAppAdapter, WhatsAppClient, WhatsAppReceiptService};
use crate::adapters::whatsapp_web::{WhatsAppWebAdapter, WhatsAppWebReceiptService};
use crate::adapters::Adapter;
use crate::config::Config;
use crate::models::Platform;
use crate::storage::{ProbeStore, SqliteStore};

pub fn register_adapters(
    config: &Config,
    store: Arc<SqliteStore>,
) -> (Arc<AdapterRegistry>, Arc<WhatsAppReceiptService>) {
    let registry = Arc::new(AdapterRegistry::new());
    let probe_store: Arc<dyn ProbeStore> = store.clone();
    let queue_cap = config.tracker.queue_cap;
    let backoff_max = config.tracker.backoff_max();

    // The webhook intake needs the WhatsApp queues even when the adapter
    // itself is disabled, so this service always exists.
    let whatsapp_service = Arc::new(WhatsAppReceiptService::new(queue_cap));

    if config.mock_enabled {
        registry.register(AdapterEntry {
            platform: Platform::Mock,
            factory: Arc::new(|_, _| Ok(Arc::new(MockAdapter::default()) as Arc<dyn Adapter>)),
            service: None,
        });
    }

    if config.signal.enabled {
        let service = Arc::new(SignalReceiptService::new(
            config.signal.clone(),
            probe_store.clone(),
            queue_cap,
            backoff_max,
        ));
        let signal_cfg = config.signal.clone();
        let directory = store.clone();
        let factory_service = Arc::clone(&service);
        registry.register(AdapterEntry {
            platform: Platform::Signal,
            factory: Arc::new(move |user_id, contact_id| {
                let client = SignalRestClient::new(&signal_cfg)?;
                Ok(Arc::new(SignalAdapter::new(
                    user_id,
                    contact_id,
                    Arc::clone(&factory_service),
                    client,
                    directory.clone(),
                )) as Arc<dyn Adapter>)
            }),
            service: Some(Arc::new(service) as Arc<dyn PlatformService>),
        });
    }

    if config.whatsapp.enabled {
        let whatsapp_cfg = config.whatsapp.clone();
        let directory = store.clone();
        let factory_service = Arc::clone(&whatsapp_service);
        registry.register(AdapterEntry {
            platform: Platform::Whatsapp,
            factory: Arc::new(move |user_id, contact_id| {
                let client = WhatsAppClient::new(&whatsapp_cfg)?;
                Ok(Arc::new(WhatsAppAdapter::new(
                    user_id,
                    contact_id,
                    Arc::clone(&factory_service),
                    client,
                    directory.clone(),
                )) as Arc<dyn Adapter>)
            }),
            service: Some(Arc::new(Arc::clone(&whatsapp_service)) as Arc<dyn PlatformService>),
        });
    }

    if config.whatsapp_web.enabled {
        let service = Arc::new(WhatsAppWebReceiptService::new(
            config.whatsapp_web.clone(),
            probe_store.clone(),
            queue_cap,
            backoff_max,
        ));
        let waweb_cfg = config.whatsapp_web.clone();
        let directory = store.clone();
        let factory_service = Arc::clone(&service);
        registry.register(AdapterEntry {
            platform: Platform::WhatsappWeb,
            factory: Arc::new(move |user_id, contact_id| {
                Ok(Arc::new(WhatsAppWebAdapter::new(
                    user_id,
                    contact_id,
                    Arc::clone(&factory_service),
                    &waweb_cfg,
                    directory.clone(),
                )?) as Arc<dyn Adapter>)
            }),
            service: Some(Arc::new(service) as Arc<dyn PlatformService>),
        });
    }

    (registry, whatsapp_service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn base_config() -> Config {
        let mut config = Config::from_env();
        config.mock_enabled = true;
        config.signal.enabled = false;
        config.whatsapp.enabled = false;
        config.whatsapp_web.enabled = false;
        config
    }

    #[test]
    fn registers_enabled_platforms_only() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (registry, _wa) = register_adapters(&base_config(), store);
        assert!(registry.supports(Platform::Mock));
        assert!(!registry.supports(Platform::Signal));
        assert!(!registry.supports(Platform::Whatsapp));
    }

    #[test]
    fn signal_factory_refuses_missing_account() {
        let mut config = base_config();
        config.signal.enabled = true;
        config.signal.account = None;
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (registry, _wa) = register_adapters(&config, store);
        assert!(registry.supports(Platform::Signal));
        assert!(registry.create(Platform::Signal, 1, 2).is_err());
    }
}
