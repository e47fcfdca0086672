//! UDP socket loop.
//!
//! A [`Listener`] owns one bound socket. Its receive loop runs on a single
//! task, decodes every datagram with the eager [`WireCodec`] and hands the
//! result to the registered handlers. Malformed datagrams are logged and
//! dropped; handler failures are isolated per handler. Neither stops the
//! loop.
//!
//! The receive call is bounded by half the watchdog interval, so the stop
//! flag is observed and the watchdog is petted at least that often even on
//! an idle socket.

use crate::core::codec::WireCodec;
use crate::core::message::{Message, ICP_PORT, MAX_DATAGRAM_SIZE};
use crate::error::{IcpError, Result};
use crate::protocol::dispatcher::{Dispatcher, HandlerId, MessageHandler};
use crate::service::collaborators::{NoopWatchdog, Watchdog};
use crate::utils::metrics::Metrics;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};

/// Default watchdog interval.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

const MIN_RECEIVE_TIMEOUT: Duration = Duration::from_millis(1);

/// Listener settings.
#[derive(Clone)]
pub struct ListenerOptions {
    /// The receive timeout is half of this.
    pub watchdog_interval: Duration,
    /// Upper bound for sent datagrams. Received datagrams are always read
    /// into a full `MAX_DATAGRAM_SIZE` buffer.
    pub max_datagram_size: usize,
    pub watchdog: Arc<dyn Watchdog>,
    pub metrics: Arc<Metrics>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            watchdog: Arc::new(NoopWatchdog),
            metrics: Arc::new(Metrics::new()),
        }
    }
}

struct Shared {
    socket: UdpSocket,
    local_addr: SocketAddr,
    dispatcher: Dispatcher,
    codec: WireCodec,
    stop: CancellationToken,
    running: AtomicBool,
    max_datagram_size: usize,
    metrics: Arc<Metrics>,
}

/// Cloneable handle for sending, registering handlers and stopping.
#[derive(Clone)]
pub struct ListenerHandle {
    shared: Arc<Shared>,
}

/// Owner of the receive loop. Consumed by [`Listener::run`].
pub struct Listener {
    shared: Arc<Shared>,
    watchdog: Arc<dyn Watchdog>,
    receive_timeout: Duration,
}

enum Step {
    Continue,
    Exit(Result<()>),
}

impl Listener {
    /// Bind a UDP socket on `addr`.
    pub async fn bind(addr: SocketAddr, options: ListenerOptions) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(socket, options)
    }

    /// Wrap an already bound socket.
    pub fn from_socket(socket: UdpSocket, options: ListenerOptions) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        let receive_timeout = (options.watchdog_interval / 2).max(MIN_RECEIVE_TIMEOUT);
        Ok(Self {
            shared: Arc::new(Shared {
                socket,
                local_addr,
                dispatcher: Dispatcher::new(),
                codec: WireCodec::new(),
                stop: CancellationToken::new(),
                running: AtomicBool::new(false),
                max_datagram_size: options.max_datagram_size.min(MAX_DATAGRAM_SIZE),
                metrics: options.metrics,
            }),
            watchdog: options.watchdog,
            receive_timeout,
        })
    }

    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Run the receive loop on a new task.
    pub fn spawn(self) -> (ListenerHandle, JoinHandle<Result<()>>) {
        let handle = self.handle();
        let task = tokio::spawn(self.run());
        (handle, task)
    }

    /// Receive loop. Returns when stopped or on a fatal socket error.
    #[instrument(skip(self), fields(local_addr = %self.shared.local_addr))]
    pub async fn run(self) -> Result<()> {
        let shared = self.shared.clone();
        let handle = self.handle();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        shared.running.store(true, Ordering::SeqCst);
        info!(
            receive_timeout_ms = self.receive_timeout.as_millis() as u64,
            "ICP listener started"
        );

        let outcome = loop {
            if shared.stop.is_cancelled() {
                break Ok(());
            }

            let step = match tokio::time::timeout(
                self.receive_timeout,
                shared.socket.recv_from(&mut buf),
            )
            .await
            {
                // Liveness pulse, not an error.
                Err(_elapsed) => Step::Continue,
                Ok(Ok((len, from))) => {
                    handle.process_datagram(&buf[..len], from);
                    Step::Continue
                }
                Ok(Err(e)) if is_transient(&e) => {
                    debug!(error = %e, "Transient ICP socket error");
                    Step::Continue
                }
                Ok(Err(e)) => {
                    if shared.stop.is_cancelled() {
                        debug!(error = %e, "ICP socket error after stop requested");
                        Step::Exit(Ok(()))
                    } else {
                        error!(error = %e, "Fatal ICP socket error, listener exiting");
                        Step::Exit(Err(IcpError::Io(e)))
                    }
                }
            };

            self.watchdog.pet();

            if let Step::Exit(result) = step {
                break result;
            }
        };

        shared.running.store(false, Ordering::SeqCst);
        info!("ICP listener stopped");
        outcome
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

impl ListenerHandle {
    fn process_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let metrics = &self.shared.metrics;
        metrics.datagram_received(datagram.len() as u64);

        let message = match self.shared.codec.decode_from(datagram, from) {
            Ok(message) => message,
            Err(e) => {
                metrics.decode_error();
                debug!(%from, len = datagram.len(), error = %e, "Dropping malformed ICP datagram");
                return;
            }
        };
        trace!(%from, %message, "ICP message received");

        match self.shared.dispatcher.dispatch(self, &message) {
            Ok(report) => {
                for _ in 0..report.failed {
                    metrics.handler_failure();
                }
            }
            Err(e) => error!(error = %e, "ICP dispatch failed"),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Whether the receive loop is currently running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    /// Ask the receive loop to exit. Observed within one receive timeout.
    pub fn stop(&self) {
        self.shared.stop.cancel();
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }

    pub fn add_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<HandlerId> {
        self.shared.dispatcher.register(handler)
    }

    pub fn add_handler_fn<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(&ListenerHandle, &Message) -> Result<()> + Send + Sync + 'static,
    {
        self.shared.dispatcher.register_fn(handler)
    }

    pub fn remove_handler(&self, id: HandlerId) -> Result<bool> {
        self.shared.dispatcher.remove(id)
    }

    pub fn handler_count(&self) -> Result<usize> {
        self.shared.dispatcher.len()
    }

    fn encode(&self, message: &Message) -> Result<bytes::Bytes> {
        self.shared
            .codec
            .encode_datagram(message, self.shared.max_datagram_size)
    }

    /// Encode `message` and write it as one datagram without waiting.
    ///
    /// `port` defaults to 3130. Safe to call from inside a handler, and
    /// before the receive loop has been spawned.
    pub fn send(&self, message: &Message, addr: IpAddr, port: Option<u16>) -> Result<usize> {
        let target = SocketAddr::new(addr, port.unwrap_or(ICP_PORT));
        let bytes = self.encode(message)?;
        let sent = match self.shared.socket.try_send_to(&bytes, target) {
            // tokio reports WouldBlock until the reactor has seen the socket
            // writable; the kernel decides for real.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                socket2::SockRef::from(&self.shared.socket).send_to(&bytes, &target.into())?
            }
            other => other?,
        };
        self.shared.metrics.datagram_sent(sent as u64);
        debug!(%target, opcode = %message.opcode(), bytes = sent, "ICP message sent");
        Ok(sent)
    }

    /// Like [`ListenerHandle::send`] but waits for the socket to be writable.
    pub async fn send_async(
        &self,
        message: &Message,
        addr: IpAddr,
        port: Option<u16>,
    ) -> Result<usize> {
        let target = SocketAddr::new(addr, port.unwrap_or(ICP_PORT));
        let bytes = self.encode(message)?;
        let sent = self.shared.socket.send_to(&bytes, target).await?;
        self.shared.metrics.datagram_sent(sent as u64);
        debug!(%target, opcode = %message.opcode(), bytes = sent, "ICP message sent");
        Ok(sent)
    }
}
