use kai_relay_core::config::{Config, SessionBackend};
use kai_relay_core::session::{FileSessionStore, InMemorySessionStore};
use kai_relay_core::utils::expand_tilde;
use kai_relay_core::SessionStore;
use kai_relay_exchange::{ExchangeController, HistoryHandler, Normalizer};
use kai_relay_providers::{OpenAiCompatClient, RetryPolicy, RetryingProvider, UpstreamProvider};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ExchangeController>,
    pub history: HistoryHandler,
}

impl AppState {
    pub fn new(controller: Arc<ExchangeController>) -> Self {
        let history = HistoryHandler::new(controller.store());
        Self {
            controller,
            history,
        }
    }

    /// Wire the session store, upstream client and controller from configuration
    pub fn from_config(config: &Config) -> Self {
        let store: Arc<dyn SessionStore> = match config.session.backend {
            SessionBackend::Memory => {
                info!("Using in-memory session store");
                Arc::new(InMemorySessionStore::with_max_turns(config.session.max_turns))
            }
            SessionBackend::File => {
                let dir = expand_tilde(&config.session.dir);
                info!("Using file session store at {}", dir.display());
                Arc::new(FileSessionStore::new(dir, config.session.max_turns))
            }
        };

        let client: Arc<dyn UpstreamProvider> = Arc::new(OpenAiCompatClient::from_config(&config.upstream));
        let provider = Arc::new(RetryingProvider::new(
            client,
            RetryPolicy::from_config(&config.upstream),
        ));
        info!(
            "Upstream: {} (default model: {})",
            config.upstream.api_base, config.upstream.model
        );

        let controller = ExchangeController::new(store, provider, Normalizer::from_config(config))
            .with_default_session(config.session.default_key.clone());

        Self::new(Arc::new(controller))
    }
}
