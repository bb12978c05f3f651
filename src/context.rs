//! Wiring of one messaging context.
//!
//! An [`MsbContext`] owns everything conversations share: the channel
//! manager with its broker adapter, the timeout scheduler, the cache of
//! response-topic multiplexers and the message factory stamped with this
//! instance's identity. Requesters, responders and responder servers are
//! cheap views onto it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::adapter::{BrokerAdapter, MemoryBroker};
use crate::channel::ChannelManager;
use crate::codec::{JsonCodec, MessageCodec};
use crate::collector::{MultiplexerRegistry, TimeoutScheduler};
use crate::config::MsbConfig;
use crate::error::{MsbError, MsbResult};
use crate::message::{Message, MessageFactory, ServiceDetails};
use crate::monitor::ChannelMonitorAgent;
use crate::protocol::{
    RequestHandler, RequestOptions, Requester, Responder, ResponderOptions, ResponderServer,
};

const LOG_TARGET: &str = "msb::context";

pub(crate) struct ContextInner {
    pub(crate) config: MsbConfig,
    pub(crate) factory: MessageFactory,
    pub(crate) channel_manager: Arc<ChannelManager>,
    pub(crate) scheduler: Arc<TimeoutScheduler>,
    pub(crate) multiplexers: MultiplexerRegistry,
    shut_down: AtomicBool,
}

/// Handle to a running messaging context. Clones share the same context.
#[derive(Clone)]
pub struct MsbContext {
    inner: Arc<ContextInner>,
}

impl MsbContext {
    pub fn builder() -> MsbContextBuilder {
        MsbContextBuilder::default()
    }

    /// Context on an in-memory broker with `config`.
    pub fn new(config: MsbConfig) -> MsbResult<Self> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &MsbConfig {
        &self.inner.config
    }

    pub fn service_details(&self) -> &ServiceDetails {
        self.inner.factory.service_details()
    }

    pub fn channel_manager(&self) -> &Arc<ChannelManager> {
        &self.inner.channel_manager
    }

    /// Requester sending to `namespace`.
    pub fn requester(&self, namespace: impl Into<String>, options: RequestOptions) -> Requester {
        Requester::new(Arc::clone(&self.inner), namespace.into(), options)
    }

    /// Responder answering `original`.
    pub fn responder(&self, original: &Message, options: &ResponderOptions) -> Responder {
        Responder::new(Arc::clone(&self.inner), original, options)
    }

    /// Server dispatching requests on `namespace` to `handler`.
    ///
    /// Nothing is consumed until [`ResponderServer::listen`] is called.
    pub fn responder_server(
        &self,
        namespace: impl Into<String>,
        options: ResponderOptions,
        handler: impl RequestHandler + 'static,
    ) -> ResponderServer {
        ResponderServer::new(
            Arc::clone(&self.inner),
            namespace.into(),
            options,
            Arc::new(handler),
        )
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stop all timers, then close every channel and the adapter. Idempotent.
    ///
    /// Conversations still in flight are aborted: their error callbacks get
    /// [`MsbError::ShutDown`] and their [`crate::protocol::Conversation`]
    /// handles resolve to [`MsbError::ConversationAborted`].
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(
            target: LOG_TARGET,
            "Shutting down messaging context of {}",
            self.inner.factory.service_details().instance_id
        );
        self.inner.multiplexers.abort_all(&MsbError::ShutDown);
        self.inner.scheduler.shutdown();
        self.inner.channel_manager.shutdown();
    }
}

impl std::fmt::Debug for MsbContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsbContext")
            .field("service_details", self.service_details())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

/// Builder of [`MsbContext`]. Defaults to an in-memory broker and JSON.
#[derive(Default)]
pub struct MsbContextBuilder {
    config: Option<MsbConfig>,
    adapter: Option<Arc<dyn BrokerAdapter>>,
    codec: Option<Arc<dyn MessageCodec>>,
    monitor: Option<Arc<dyn ChannelMonitorAgent>>,
}

impl MsbContextBuilder {
    pub fn config(mut self, config: MsbConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn BrokerAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn monitor_agent(mut self, agent: Arc<dyn ChannelMonitorAgent>) -> Self {
        self.monitor = Some(agent);
        self
    }

    pub fn build(self) -> MsbResult<MsbContext> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let adapter = self
            .adapter
            .unwrap_or_else(|| Arc::new(MemoryBroker::new()));
        let codec = self.codec.unwrap_or_else(|| Arc::new(JsonCodec));
        let channel_manager = Arc::new(ChannelManager::new(&config, adapter, codec));
        if let Some(agent) = self.monitor {
            channel_manager.set_monitor_agent(agent);
        }
        let scheduler = Arc::new(TimeoutScheduler::new(config.timer_thread_pool_size)?);
        let factory = MessageFactory::new(ServiceDetails::from_config(&config));

        log::debug!(
            target: LOG_TARGET,
            "Started messaging context for {} {} (instance {})",
            factory.service_details().name,
            factory.service_details().version,
            factory.service_details().instance_id
        );

        Ok(MsbContext {
            inner: Arc::new(ContextInner {
                multiplexers: MultiplexerRegistry::new(Arc::clone(&channel_manager)),
                config,
                factory,
                channel_manager,
                scheduler,
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

impl std::fmt::Debug for MsbContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsbContextBuilder")
            .field("config", &self.config)
            .field("adapter", &self.adapter.is_some())
            .field("codec", &self.codec.is_some())
            .field("monitor", &self.monitor.is_some())
            .finish()
    }
}
