use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::broker::connection::Connection;
use crate::broker::log::{self, Logger};
use crate::message::Message;
use crate::packet::{QoS, MAX_REMAINING_LENGTH};
use crate::transport::{Listener, Transport};

/// Callback for acceptor-loop failures. Receiving one means the listener
/// itself died and the engine should be restarted.
pub type OnError = Box<dyn Fn(&crate::Error) + Send + Sync>;

pub struct EngineOptions {
    /// How long a fresh connection may take to produce its CONNECT packet.
    pub connect_timeout: Duration,

    /// Cap on the remaining length of any single inbound packet. Exceeding
    /// it is a fatal protocol error.
    pub max_packet_size: usize,

    /// Initial capacity of the per-connection read and write buffers.
    pub read_buffer: usize,
    pub write_buffer: usize,

    /// Observer for per-connection events; see [`Logger`].
    pub logger: Option<Logger>,

    /// Called when an acceptor loop dies.
    pub on_error: Option<OnError>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            connect_timeout: Duration::from_secs(10),
            max_packet_size: MAX_REMAINING_LENGTH,
            read_buffer: 8192,
            write_buffer: 8192,
            logger: None,
            on_error: None,
        }
    }
}

/// The engine accepts transport connections and runs one [`Connection`] task
/// per client until [`Engine::close`] is called.
pub struct Engine<B> {
    shared: Arc<Shared<B>>,
    /// Every task the engine runs: one acceptor per listener plus one task
    /// per connection. Acceptors spawn their connections into the same set.
    tasks: Arc<Mutex<JoinSet<()>>>,
}

pub(crate) struct Shared<B> {
    pub backend: B,
    pub logger: Logger,
    pub on_error: Option<OnError>,
    pub connect_timeout: Duration,
    pub max_packet_size: usize,
    pub read_buffer: usize,
    pub write_buffer: usize,
    /// Engine-wide shutdown signal; every connection holds a child token.
    pub shutdown: CancellationToken,
}

impl<B: Backend> Engine<B> {
    pub fn new(backend: B, mut options: EngineOptions) -> Self {
        Engine {
            shared: Arc::new(Shared {
                backend,
                logger: options.logger.take().unwrap_or_else(log::noop),
                on_error: options.on_error.take(),
                connect_timeout: options.connect_timeout,
                max_packet_size: options.max_packet_size,
                read_buffer: options.read_buffer,
                write_buffer: options.write_buffer,
                shutdown: CancellationToken::new(),
            }),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Begin accepting connections from the listener.
    ///
    /// The acceptor runs until the listener fails; a caller shutting the
    /// engine down closes its listeners first, which surfaces here as an
    /// accept error and lets the acceptor exit naturally before
    /// [`Engine::close`] drains the tasks.
    pub fn accept(&self, mut listener: Listener) {
        let shared = self.shared.clone();
        let tasks = self.tasks.clone();

        self.spawn(async move {
            if let Ok(listen_addr) = listener.local_addr() {
                tracing::info!(%listen_addr, "listening for connections");
            }

            loop {
                match listener.accept().await {
                    Ok(transport) => {
                        let connection = Connection::new(
                            transport,
                            shared.shutdown.child_token(),
                            shared.clone(),
                        );

                        lock(&tasks).spawn(connection.run());
                    }
                    Err(e) => {
                        tracing::error!(?e, "accept failed, stopping acceptor");

                        if let Some(on_error) = &shared.on_error {
                            on_error(&e);
                        }

                        break;
                    }
                }
            }
        });
    }

    /// Take over responsibility for a single connection.
    ///
    /// This is the direct-injection variant of [`Engine::accept`], useful for
    /// tests and custom listeners.
    pub fn handle<T: Transport>(&self, transport: T) {
        self.spawn(
            Connection::new(transport, self.shared.shutdown.child_token(), self.shared.clone())
                .run(),
        );
    }

    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        lock(&self.tasks).spawn(task);
    }

    /// Stop all current clients and wait for every task to drain.
    ///
    /// Listeners passed to [`Engine::accept`] must be closed by the caller
    /// beforehand so their acceptors have exited; this call blocks until they
    /// have.
    pub async fn close(self) {
        let notice = Message::new(
            "$SYS/notices",
            Bytes::from_static(b"shutting down"),
            QoS::AtMostOnce,
        );

        if let Err(e) = self.shared.backend.publish(notice).await {
            tracing::debug!(?e, "failed to publish shutdown notice");
        }

        self.shared.shutdown.cancel();

        // Take the set out so draining does not hold the lock across awaits.
        let mut tasks = std::mem::take(&mut *lock(&self.tasks));

        while tasks.join_next().await.is_some() {
            tracing::trace!("{} tasks remaining", tasks.len());
        }
    }

    /// The number of tasks (acceptors and connections) still running.
    pub fn connections(&self) -> usize {
        lock(&self.tasks).len()
    }
}

fn lock(tasks: &Mutex<JoinSet<()>>) -> MutexGuard<'_, JoinSet<()>> {
    // The lock is only held for spawn and len calls, which do not panic.
    tasks.lock().expect("BUG: engine task set poisoned")
}
