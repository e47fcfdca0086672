use crate::core::message::Message;
use crate::error::{constants, IcpError, Result};
use crate::transport::udp::ListenerHandle;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Receives every message decoded by a listener.
///
/// Handlers run on the listener task and must return quickly; a slow
/// handler stalls message processing and watchdog petting.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, listener: &ListenerHandle, message: &Message) -> Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&ListenerHandle, &Message) -> Result<()> + Send + Sync,
{
    fn handle_message(&self, listener: &ListenerHandle, message: &Message) -> Result<()> {
        self(listener, message)
    }
}

/// Token returned by [`Dispatcher::register`], used to remove the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Outcome of delivering one message to every handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

type HandlerList = Vec<(HandlerId, Arc<dyn MessageHandler>)>;

/// Mutex-guarded list of handlers with isolated fan-out.
///
/// A handler that returns an error or panics is logged and skipped; the
/// remaining handlers still see the message.
pub struct Dispatcher {
    handlers: Mutex<HandlerList>,
    next_id: AtomicU64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, handler: Arc<dyn MessageHandler>) -> Result<HandlerId> {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self
            .handlers
            .lock()
            .map_err(|_| IcpError::LockPoisoned(constants::ERR_HANDLERS_LOCK))?;
        handlers.push((id, handler));
        Ok(id)
    }

    pub fn register_fn<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(&ListenerHandle, &Message) -> Result<()> + Send + Sync + 'static,
    {
        self.register(Arc::new(handler))
    }

    /// Returns whether a handler with `id` was registered.
    pub fn remove(&self, id: HandlerId) -> Result<bool> {
        let mut handlers = self
            .handlers
            .lock()
            .map_err(|_| IcpError::LockPoisoned(constants::ERR_HANDLERS_LOCK))?;
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        Ok(handlers.len() != before)
    }

    pub fn len(&self) -> Result<usize> {
        self.handlers
            .lock()
            .map(|handlers| handlers.len())
            .map_err(|_| IcpError::LockPoisoned(constants::ERR_HANDLERS_LOCK))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Deliver `message` to every handler registered at the time of the
    /// call. The list is snapshotted under the lock and handlers run
    /// outside it, so a handler may register or remove handlers.
    pub fn dispatch(&self, listener: &ListenerHandle, message: &Message) -> Result<DispatchReport> {
        let snapshot: HandlerList = self
            .handlers
            .lock()
            .map_err(|_| IcpError::LockPoisoned(constants::ERR_HANDLERS_LOCK))?
            .clone();

        let mut report = DispatchReport::default();
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| {
                handler.handle_message(listener, message)
            })) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(handler = ?id, error = %e, "ICP handler failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(handler = ?id, "ICP handler panicked");
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Opcode;
    use crate::transport::udp::{Listener, ListenerOptions};
    use std::sync::atomic::AtomicUsize;

    async fn handle() -> ListenerHandle {
        Listener::bind("127.0.0.1:0".parse().unwrap(), ListenerOptions::default())
            .await
            .expect("bind")
            .handle()
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_block_others() {
        let listener = handle().await;
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));

        dispatcher
            .register_fn(|_: &ListenerHandle, _: &Message| panic!("bad handler"))
            .unwrap();
        dispatcher
            .register_fn(|_: &ListenerHandle, m: &Message| Err(IcpError::NotAQuery(m.opcode())))
            .unwrap();
        let counter = seen.clone();
        dispatcher
            .register_fn(move |_: &ListenerHandle, _: &Message| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let report = dispatcher
            .dispatch(&listener, &Message::new(Opcode::Hit, 1, "u"))
            .unwrap();
        assert_eq!(report, DispatchReport { delivered: 1, failed: 2 });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_handler() {
        let listener = handle().await;
        let dispatcher = Dispatcher::new();
        let id = dispatcher
            .register_fn(|_: &ListenerHandle, _: &Message| Ok(()))
            .unwrap();
        assert_eq!(dispatcher.len().unwrap(), 1);
        assert!(dispatcher.remove(id).unwrap());
        assert!(!dispatcher.remove(id).unwrap());
        assert!(dispatcher.is_empty().unwrap());
        let report = dispatcher
            .dispatch(&listener, &Message::new(Opcode::Hit, 1, "u"))
            .unwrap();
        assert_eq!(report.delivered, 0);
    }

    #[test]
    fn test_poisoned_lock_is_reported() {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher
            .register_fn(|_: &ListenerHandle, _: &Message| Ok(()))
            .unwrap();

        let poisoner = dispatcher.clone();
        let joined = std::thread::spawn(move || {
            let _guard = poisoner.handlers.lock().unwrap();
            panic!("poison the handler list");
        })
        .join();
        assert!(joined.is_err());

        assert!(matches!(dispatcher.len(), Err(IcpError::LockPoisoned(_))));
        assert!(matches!(dispatcher.is_empty(), Err(IcpError::LockPoisoned(_))));
        assert!(matches!(
            dispatcher.register_fn(|_: &ListenerHandle, _: &Message| Ok(())),
            Err(IcpError::LockPoisoned(_))
        ));
    }
}
