//! ICP responder lifecycle and query answering.
//!
//! [`QueryResponder`] is the listener handler that turns a peer's query into
//! DENIED, HIT or MISS_NOFETCH using the host's authorization and cache
//! collaborators. [`IcpCoordinator`] owns the port reservation and the
//! listener task, and reacts to configuration changes.

use crate::config::IcpSection;
use crate::core::message::{Message, ZERO_ADDRESS};
use crate::error::{IcpError, Result};
use crate::protocol::builder::{QueryBuilder, ResponseBuilder};
use crate::protocol::dispatcher::{HandlerId, MessageHandler};
use crate::service::collaborators::{
    Authorizer, CacheLookup, RateLimiter, ResourceManager, Watchdog,
};
use crate::transport::udp::{Listener, ListenerHandle, ListenerOptions};
use crate::utils::metrics::Metrics;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

/// Owner name used for port reservations.
pub const PORT_OWNER: &str = "ICP";

/// Answers queries received by a listener.
pub struct QueryResponder {
    builder: ResponseBuilder,
    authorizer: Arc<dyn Authorizer>,
    cache: Arc<dyn CacheLookup>,
    rate_limiter: Arc<dyn RateLimiter>,
    metrics: Arc<Metrics>,
}

impl QueryResponder {
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        cache: Arc<dyn CacheLookup>,
        rate_limiter: Arc<dyn RateLimiter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            builder: ResponseBuilder::new(),
            authorizer,
            cache,
            rate_limiter,
            metrics,
        }
    }

    /// Decide the response to `message`, or `None` if nothing is sent.
    ///
    /// Non-queries and rate-limited queries get no response. A peer is
    /// judged by its transport address, never by the sender field.
    pub fn respond(&self, message: &Message) -> Option<Message> {
        if !message.is_query() {
            trace!(opcode = %message.opcode(), "Ignoring non-query ICP message");
            return None;
        }
        self.metrics.query();

        if !self.rate_limiter.allow_now() {
            self.metrics.rate_limit();
            debug!(source = ?message.source(), "ICP query rate limited");
            return None;
        }

        match self.answer(message) {
            Ok(response) => Some(response),
            Err(e) => self.fall_back(message, e),
        }
    }

    /// Protocol failures are answered with ICP_OP_ERR; anything else drops
    /// the query.
    fn fall_back(&self, message: &Message, error: IcpError) -> Option<Message> {
        if !error.is_protocol_error() {
            self.metrics.drop_query();
            warn!(error = %error, "ICP query failed, dropping it");
            return None;
        }
        warn!(error = %error, "Could not build ICP response, trying ICP_OP_ERR");
        match self.builder.error(message) {
            Ok(response) => {
                self.metrics.error_response();
                Some(response)
            }
            Err(e) => {
                self.metrics.drop_query();
                warn!(error = %e, "Could not build ICP_OP_ERR, dropping query");
                None
            }
        }
    }

    fn answer(&self, query: &Message) -> Result<Message> {
        let allowed = query
            .source_address()
            .is_some_and(|ip| self.authorizer.is_allowed(ip));
        if !allowed {
            self.metrics.deny();
            debug!(source = ?query.source(), "ICP query denied");
            return self.builder.denied(query);
        }

        // A miss never triggers a fetch.
        if self.cache.has_content(query.payload_url()) {
            self.metrics.hit();
            self.builder.hit(query)
        } else {
            self.metrics.miss();
            self.builder.miss_no_fetch(query)
        }
    }
}

impl MessageHandler for QueryResponder {
    fn handle_message(&self, listener: &ListenerHandle, message: &Message) -> Result<()> {
        let Some(response) = self.respond(message) else {
            return Ok(());
        };
        let Some(source) = message.source() else {
            self.metrics.drop_query();
            return Ok(());
        };
        listener
            .send(&response, source.ip(), Some(source.port()))
            .map(|_| ())
            .inspect_err(|_| self.metrics.drop_query())
    }
}

/// External services the coordinator needs.
#[derive(Clone)]
pub struct Collaborators {
    pub authorizer: Arc<dyn Authorizer>,
    pub cache: Arc<dyn CacheLookup>,
    pub resources: Arc<dyn ResourceManager>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub watchdog: Arc<dyn Watchdog>,
}

struct Running {
    handle: ListenerHandle,
    task: JoinHandle<Result<()>>,
    handler: HandlerId,
    port: u16,
}

struct State {
    config: IcpSection,
    running: Option<Running>,
}

/// Starts, stops and reconfigures the ICP responder.
pub struct IcpCoordinator {
    collaborators: Collaborators,
    responder: Arc<QueryResponder>,
    queries: QueryBuilder,
    metrics: Arc<Metrics>,
    state: Mutex<State>,
}

impl IcpCoordinator {
    pub fn new(collaborators: Collaborators) -> Self {
        let metrics = Arc::new(Metrics::new());
        let responder = Arc::new(QueryResponder::new(
            collaborators.authorizer.clone(),
            collaborators.cache.clone(),
            collaborators.rate_limiter.clone(),
            metrics.clone(),
        ));
        Self {
            collaborators,
            responder,
            queries: QueryBuilder::with_random_seed(),
            metrics,
            state: Mutex::new(State {
                config: IcpSection::default(),
                running: None,
            }),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .running
            .as_ref()
            .is_some_and(|r| r.handle.is_running() || !r.task.is_finished())
    }

    /// Address the listener is bound to, if running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .await
            .running
            .as_ref()
            .map(|r| r.handle.local_addr())
    }

    /// Start with `config` if it is enabled. Fails closed if the port cannot
    /// be reserved or bound.
    #[instrument(skip(self, config), fields(port = config.port, enabled = config.enabled))]
    pub async fn start(&self, config: IcpSection) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.running.is_some() {
            return Err(IcpError::AlreadyRunning);
        }
        self.start_locked(&mut state, config).await
    }

    /// Stop the listener and release the port. Stopping a stopped
    /// coordinator is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state).await
    }

    /// Apply a changed configuration: restart when the enabled flag or the
    /// socket settings changed, otherwise only retune the rate limiter.
    #[instrument(skip(self, config), fields(port = config.port, enabled = config.enabled))]
    pub async fn apply_config(&self, config: IcpSection) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.running.is_none() || state.config.needs_restart(&config) {
            self.stop_locked(&mut state).await?;
            return self.start_locked(&mut state, config).await;
        }
        self.collaborators.rate_limiter.reconfigure(&config.rate_limit)?;
        state.config = config;
        Ok(())
    }

    async fn start_locked(&self, state: &mut State, config: IcpSection) -> Result<()> {
        if !config.enabled {
            info!("ICP disabled");
            state.config = config;
            return Ok(());
        }

        let bind_ip = config.bind_ip()?;
        self.collaborators.rate_limiter.reconfigure(&config.rate_limit)?;

        if !self
            .collaborators
            .resources
            .reserve_udp_port(config.port, PORT_OWNER)
        {
            error!(port = config.port, "ICP port unavailable, not starting");
            return Err(IcpError::PortUnavailable(config.port));
        }

        let options = ListenerOptions {
            watchdog_interval: config.watchdog_interval,
            max_datagram_size: config.max_datagram_size,
            watchdog: self.collaborators.watchdog.clone(),
            metrics: self.metrics.clone(),
        };
        let listener = match Listener::bind(SocketAddr::new(bind_ip, config.port), options).await {
            Ok(listener) => listener,
            Err(e) => {
                self.collaborators
                    .resources
                    .release_udp_port(config.port, PORT_OWNER);
                error!(port = config.port, error = %e, "Could not bind ICP socket");
                return Err(e);
            }
        };

        let handler = match listener.handle().add_handler(self.responder.clone()) {
            Ok(handler) => handler,
            Err(e) => {
                self.collaborators
                    .resources
                    .release_udp_port(config.port, PORT_OWNER);
                return Err(e);
            }
        };
        let local_addr = listener.local_addr();
        let (handle, task) = listener.spawn();
        info!(%local_addr, "ICP started");

        state.running = Some(Running {
            handle,
            task,
            handler,
            port: config.port,
        });
        state.config = config;
        Ok(())
    }

    async fn stop_locked(&self, state: &mut State) -> Result<()> {
        let Some(running) = state.running.take() else {
            return Ok(());
        };

        running.handle.stop();
        if let Err(e) = running.handle.remove_handler(running.handler) {
            warn!(error = %e, "Could not unregister ICP responder");
        }
        match running.task.await {
            Ok(Ok(())) => debug!("ICP listener exited cleanly"),
            Ok(Err(e)) => warn!(error = %e, "ICP listener had exited with an error"),
            Err(e) => error!(error = %e, "ICP listener task failed"),
        }

        self.collaborators
            .resources
            .release_udp_port(running.port, PORT_OWNER);
        info!(port = running.port, "ICP stopped");
        Ok(())
    }

    /// Send a query for `url` to a peer cache and return its request number.
    pub async fn send_query(
        &self,
        url: &str,
        peer: IpAddr,
        port: Option<u16>,
        request_src_rtt: bool,
    ) -> Result<u32> {
        let handle = {
            let state = self.state.lock().await;
            state
                .running
                .as_ref()
                .map(|r| r.handle.clone())
                .ok_or(IcpError::NotRunning)?
        };
        let requester = match handle.local_addr().ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => ip,
            _ => ZERO_ADDRESS,
        };
        let query = self
            .queries
            .query_with_options(requester, url, request_src_rtt, false);
        handle.send_async(&query, peer, port).await?;
        Ok(query.request_number())
    }
}

impl Drop for IcpCoordinator {
    fn drop(&mut self) {
        if let Ok(state) = self.state.try_lock() {
            if let Some(running) = state.running.as_ref() {
                running.handle.stop();
            }
        }
    }
}
