//! Application state shared across routes

use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, StoreBackend};
use crate::game::MatchRegistry;
use crate::notify::{ChatSink, NotificationSink, TracingSink};
use crate::store::{MatchStore, MemoryMatchStore, SupabaseClient, SupabaseMatchStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<MatchRegistry>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        // Wire the store and the chat sink to the configured backend
        let (store, notifier): (Arc<dyn MatchStore>, Arc<dyn NotificationSink>) =
            match config.store_backend {
                StoreBackend::Supabase => {
                    // from_env has already checked these are present
                    let url = config.supabase_url.as_deref().unwrap_or_default();
                    let key = config.supabase_service_role_key.as_deref().unwrap_or_default();
                    let client = SupabaseClient::new(url, key);
                    (
                        Arc::new(SupabaseMatchStore::new(client.clone())),
                        Arc::new(ChatSink::new(client)),
                    )
                }
                StoreBackend::Memory => {
                    (Arc::new(MemoryMatchStore::new()), Arc::new(TracingSink))
                }
            };

        let registry = Arc::new(MatchRegistry::new(
            store,
            notifier,
            config.phase_durations,
            Duration::from_secs(config.retire_grace_secs),
        ));

        Self { config, registry }
    }
}
