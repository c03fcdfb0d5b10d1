//! Process root
//!
//! Builds the shared dependencies once (bus, session buffer, durable
//! store, collaborator clients) and hands them to each component started
//! by `serve`.

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::buffer::{SessionBuffer, SledSessionBuffer};
use crate::bus::kafka::{KafkaPublisher, KafkaSubscriber};
use crate::bus::memory::MemoryBus;
use crate::bus::{MessageHandler, Publisher, Subscriber};
use crate::cli::Component;
use crate::config::{BusBackend, BusConfig, Config};
use crate::error::Result;
use crate::hub::{server, Hub, HubState, ReplyRouter};
use crate::orchestrator::{Collaborators, Orchestrator};
use crate::providers::OllamaGenerator;
use crate::services::{HttpVectorSearch, HttpVectorizer};
use crate::store::SledStore;
use crate::synchronizer::Synchronizer;
use crate::vectorization::VectorizationWorker;

/// Creates the publisher and subscriber for the configured backend
pub fn build_bus(config: &BusConfig) -> Result<(Arc<dyn Publisher>, Arc<dyn Subscriber>)> {
    match config.backend {
        BusBackend::Kafka => {
            let settings = config.kafka_settings();
            let publisher: Arc<dyn Publisher> = Arc::new(KafkaPublisher::new(&settings)?);
            let subscriber: Arc<dyn Subscriber> = Arc::new(KafkaSubscriber::new(settings));
            Ok((publisher, subscriber))
        }
        BusBackend::Memory => {
            tracing::warn!("Using the in-process bus; messages do not survive a restart");
            let bus = Arc::new(
                MemoryBus::new(config.memory_partitions).with_retry_backoff(config.retry_backoff()),
            );
            let publisher: Arc<dyn Publisher> = bus.clone();
            let subscriber: Arc<dyn Subscriber> = bus;
            Ok((publisher, subscriber))
        }
    }
}

/// Components to start, in start-up order; all of them when none is named
pub fn select_components(requested: &[Component]) -> Vec<Component> {
    Component::ALL
        .into_iter()
        .filter(|c| requested.is_empty() || requested.contains(c))
        .collect()
}

/// Dependencies shared by every component of one process
pub struct Pipeline {
    config: Config,
    publisher: Arc<dyn Publisher>,
    subscriber: Arc<dyn Subscriber>,
    buffer: Arc<dyn SessionBuffer>,
    store: Arc<SledStore>,
}

impl Pipeline {
    /// Opens the stores and connects the bus
    pub fn open(config: Config) -> Result<Self> {
        let (publisher, subscriber) = build_bus(&config.bus)?;
        let buffer = SledSessionBuffer::open(&config.storage.buffer_path).with_context(|| {
            format!(
                "opening session buffer at {}",
                config.storage.buffer_path.display()
            )
        })?;
        let store = SledStore::open(&config.storage.durable_path).with_context(|| {
            format!(
                "opening durable store at {}",
                config.storage.durable_path.display()
            )
        })?;

        Ok(Self::with_parts(
            config,
            publisher,
            subscriber,
            Arc::new(buffer),
            Arc::new(store),
        ))
    }

    /// Assembles a pipeline from already built parts
    pub fn with_parts(
        config: Config,
        publisher: Arc<dyn Publisher>,
        subscriber: Arc<dyn Subscriber>,
        buffer: Arc<dyn SessionBuffer>,
        store: Arc<SledStore>,
    ) -> Self {
        Self {
            config,
            publisher,
            subscriber,
            buffer,
            store,
        }
    }

    /// Runs `components` until `shutdown` fires or one of them fails
    pub async fn run(self, components: &[Component], shutdown: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();
        for component in select_components(components) {
            self.start(component, &mut tasks, &shutdown).await?;
            tracing::info!(component = component.as_str(), "Component started");
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(anyhow::Error::from)
                .and_then(|result| result);
            if let Err(e) = outcome {
                tracing::error!("Component stopped with error: {:#}", e);
                shutdown.cancel();
                failure.get_or_insert(e);
            }
        }

        tracing::info!("All components stopped");
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn start(
        &self,
        component: Component,
        tasks: &mut JoinSet<Result<()>>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let topics = &self.config.bus.topics;
        match component {
            Component::Synchronizer => {
                let handler = Synchronizer::new(Arc::clone(&self.buffer), self.store.clone());
                self.consume(tasks, component, &topics.db_ops, Arc::new(handler), shutdown);
            }
            Component::Vectorizer => {
                let vectorizer = HttpVectorizer::new(&self.config.vectorizer)?;
                let handler = VectorizationWorker::new(
                    self.store.clone(),
                    Arc::new(vectorizer),
                    Arc::clone(&self.publisher),
                    &topics.server_reply,
                );
                self.consume(tasks, component, &topics.vectorize_file, Arc::new(handler), shutdown);
            }
            Component::Orchestrator => {
                let deps = Collaborators {
                    buffer: Arc::clone(&self.buffer),
                    chats: self.store.clone(),
                    files: self.store.clone(),
                    search: Arc::new(HttpVectorSearch::new(&self.config.vector_search)?),
                    generator: Arc::new(OllamaGenerator::new(self.config.generation.clone())?),
                    publisher: Arc::clone(&self.publisher),
                };
                let handler = Orchestrator::new(deps, &self.config, shutdown.clone());
                self.consume(tasks, component, &topics.user_query, Arc::new(handler), shutdown);
            }
            Component::Hub => {
                let listener = TcpListener::bind(&self.config.hub.bind_addr)
                    .await
                    .with_context(|| format!("binding hub to {}", self.config.hub.bind_addr))?;
                let hub = Arc::new(Hub::new(self.config.hub.outbound_queue_capacity));
                let state = HubState {
                    hub: Arc::clone(&hub),
                    publisher: Arc::clone(&self.publisher),
                    topics: topics.clone(),
                    config: self.config.hub.clone(),
                };
                tasks.spawn(server::serve(listener, state, shutdown.clone()));
                self.consume(
                    tasks,
                    component,
                    &topics.server_reply,
                    Arc::new(ReplyRouter::new(hub)),
                    shutdown,
                );
            }
        }
        Ok(())
    }

    fn consume(
        &self,
        tasks: &mut JoinSet<Result<()>>,
        component: Component,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: &CancellationToken,
    ) {
        let subscriber = Arc::clone(&self.subscriber);
        let topic = topic.to_string();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            subscriber
                .run(component.as_str(), &topic, handler, shutdown)
                .await
        });
    }
}

/// Cancels `shutdown` on Ctrl-C
pub fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Interrupt received, shutting down"),
            Err(e) => tracing::error!("Cannot listen for Ctrl-C: {}", e),
        }
        shutdown.cancel();
    });
}
