// Composition root: every long-lived handle is built once here and shared
// as `Arc`, then the inbound dispatch loop runs until shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use sapiens_core::config::Config;
use sapiens_core::model::UserId;
use sapiens_core::store::{self, ProfileStore};
use sapiens_llm::{LlmClient, NarrativeGenerator, NarrativeSettings};

use crate::broadcaster::Broadcaster;
use crate::conversation::ConversationEngine;
use crate::relay::{self, RelayClient, RelayState};
use crate::scheduler::{DailyReportJob, ReportScheduler};
use crate::transport::telegram::{self, TelegramTransport};
use crate::transport::InboundEvent;

/// Capacity of the inbound event channel between the poller and dispatch.
const INBOUND_CAPACITY: usize = 256;
/// Size of the per-user ordering table at which finished entries are pruned.
const PRUNE_THRESHOLD: usize = 1024;

pub struct App {
    config: Config,
    transport: Arc<TelegramTransport>,
    engine: Arc<ConversationEngine>,
    scheduler: ReportScheduler,
    relay: Option<RelayState>,
}

impl App {
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let token = config
            .credentials
            .bot_token
            .as_deref()
            .context("bot_token missing from credentials")?;

        let store: Arc<dyn ProfileStore> =
            store::open_from_config(&config).context("failed to open profile store")?;

        let transport =
            Arc::new(TelegramTransport::new(token).context("failed to build chat transport")?);

        let llm_client = LlmClient::from_config(&config);
        if llm_client.is_active() {
            info!("LLM client initialized (API key configured)");
        } else {
            info!("LLM client disabled (no API key), canned text will be used");
        }
        let narrative = Arc::new(NarrativeGenerator::new(
            Arc::new(llm_client),
            NarrativeSettings::from(&config.llm),
        ));

        let broadcaster = Arc::new(Broadcaster::new(transport.clone(), config.channel.id));
        if !broadcaster.channel_configured() {
            info!("No channel configured, chronicles will not be published");
        }

        let engine = Arc::new(ConversationEngine::new(
            Arc::clone(&store),
            transport.clone(),
            Arc::clone(&narrative),
            Arc::clone(&broadcaster),
        ));

        let job = Arc::new(DailyReportJob::new(
            Arc::clone(&store),
            Arc::clone(&narrative),
            Arc::clone(&broadcaster),
        ));
        let scheduler = ReportScheduler::new(config.report, job);

        let relay = match (config.relay.enabled, config.relay.url.as_deref()) {
            (true, Some(url)) => Some(RelayState {
                narrative: Arc::clone(&narrative),
                client: Arc::new(
                    RelayClient::new(url, &config.relay.bot_name)
                        .context("failed to build relay client")?,
                ),
            }),
            _ => None,
        };

        Ok(Self {
            config,
            transport,
            engine,
            scheduler,
            relay,
        })
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);

        let poll_handle = tokio::spawn({
            let transport = Arc::clone(&self.transport);
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = telegram::run_polling(transport, tx, shutdown).await {
                    error!("Long-poll loop error: {e}");
                }
            }
        });

        let relay_handle = match self.relay.clone() {
            Some(state) => Some(self.start_relay(state, shutdown.clone()).await),
            None => None,
        };

        self.scheduler.start();

        info!("Boto Sapiens is running");
        dispatch(rx, Arc::clone(&self.engine), shutdown).await;

        self.scheduler.shutdown();
        self.scheduler.wait_for_in_flight().await;
        let _ = poll_handle.await;
        if let Some(handle) = relay_handle {
            let _ = handle.await;
        }

        info!("Boto Sapiens stopped");
        Ok(())
    }

    async fn start_relay(
        &self,
        state: RelayState,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let relay_config = &self.config.relay;

        if state.client.check_health().await {
            info!("Relay is reachable");
        } else {
            warn!("Relay health check failed, continuing anyway");
        }
        if let Some(webhook_url) = relay_config.webhook_url.as_deref() {
            if !state.client.register(webhook_url).await {
                warn!("Relay registration failed, continuing anyway");
            }
        }

        let port = relay_config.listen_port;
        tokio::spawn(async move {
            if let Err(e) = relay::serve(port, state, shutdown).await {
                error!("Relay server error: {e:#}");
            }
        })
    }
}

/// Hand each inbound event to the engine on its own task. Events of one user
/// run strictly in arrival order, each task waiting for the previous one of
/// that user; different users interleave freely. Returns when the channel
/// closes or `shutdown` flips to true.
pub async fn dispatch(
    mut rx: mpsc::Receiver<InboundEvent>,
    engine: Arc<ConversationEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_task: HashMap<UserId, oneshot::Receiver<()>> = HashMap::new();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    info!("Inbound channel closed");
                    break;
                };

                if last_task.len() >= PRUNE_THRESHOLD {
                    // Drop users whose last task has finished.
                    last_task.retain(|_, done| {
                        matches!(done.try_recv(), Err(TryRecvError::Empty))
                    });
                }

                let (done_tx, done_rx) = oneshot::channel::<()>();
                let previous = last_task.insert(event.user().id, done_rx);
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    if let Some(previous) = previous {
                        // Resolves when the previous task finishes or panics.
                        let _ = previous.await;
                    }
                    engine.handle_event(event).await;
                    drop(done_tx);
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Shutdown requested, stopping dispatch");
                    break;
                }
            }
        }
    }
}
