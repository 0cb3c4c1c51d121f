use std::sync::Arc;

use poll_tally::{
    config::TallyConfig,
    poll::{self, PollDefinition, PollRegistry, PollTallier, Upstreams},
    types::{Network, PollId},
};
use tokio::sync::Notify;

use crate::cli::Config;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to build upstream HTTP clients")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Poll(#[from] poll::Error),
}

#[derive(Clone)]
pub struct App {
    pub tallier: Arc<PollTallier>,
    pub registry: Arc<PollRegistry>,
    pub network: Network,
    shutdown: Arc<Notify>,
}

impl App {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let registry = PollRegistry::load(&config.polls_file, config.network)?;
        tracing::info!(
            polls = registry.len(),
            file = %config.polls_file.display(),
            "loaded poll definitions"
        );
        let upstreams = Upstreams::http(&config.upstream)?;
        Ok(Self::with_upstreams(
            upstreams,
            registry,
            config.tally.clone(),
        ))
    }

    pub fn with_upstreams(
        upstreams: Upstreams,
        registry: PollRegistry,
        tally: TallyConfig,
    ) -> Self {
        let network = tally.network;
        Self {
            tallier: Arc::new(PollTallier::new(upstreams, tally)),
            registry: Arc::new(registry),
            network,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn poll(
        &self,
        poll_id: &PollId,
    ) -> Result<&PollDefinition, poll::Error> {
        self.registry.get(poll_id)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Resolves once [`Self::request_shutdown`] has been called
    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await
    }
}
