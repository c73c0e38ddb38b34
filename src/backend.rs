//! The pluggable session store and fan-out layer.
//!
//! The connection state machine owns the protocol invariants; everything
//! durable lives behind [`Backend`]: which sessions exist, who subscribes to
//! what, and which message is retained where. The in-memory implementation
//! here is the default; a persistent store can replace it without touching
//! the state machine.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::collections::{hash_map, FnvHashMap, HashMap};
use crate::message::Message;
use crate::packet::{Login, QoS};
use crate::session::{MailSender, Session, Subscriptions};
use crate::topic::{Filter, SubscriptionTree, TopicName, Tree};
use crate::ClientId;

/// Why a connection is handing its session back.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DetachReason {
    /// The client sent DISCONNECT.
    Clean,
    /// The transport died or the client violated the protocol.
    Lost,
    /// Another connection attached with the same client ID.
    TakenOver,
}

/// The result of attaching a connection to a session.
pub struct Attached {
    /// The session, owned by the connection until it detaches.
    pub session: Session,
    /// Whether stored state was resumed, reported in CONNACK [MQTT-3.2.2-2].
    pub session_present: bool,
}

pub trait Backend: Send + Sync + 'static {
    /// Authentication hook, consulted before a session is attached.
    ///
    /// Policy is entirely up to the implementation; the broker only maps a
    /// denial to the CONNACK return code.
    fn authenticate(
        &self,
        client_id: ClientId,
        login: Option<&Login>,
    ) -> impl Future<Output = crate::Result<bool>> + Send;

    /// Attach a connection to the session for `client_id`, creating or
    /// resuming it per `clean_session`.
    ///
    /// If another live connection holds the session, its `token` is cancelled
    /// and this call waits for it to detach, so the prior connection is gone
    /// before the new one is acknowledged.
    fn attach(
        &self,
        client_id: ClientId,
        clean_session: bool,
        token: CancellationToken,
    ) -> impl Future<Output = crate::Result<Attached>> + Send;

    /// Hand the session back. Clean sessions are discarded along with their
    /// subscriptions; others are stored for a later reconnect.
    fn detach(
        &self,
        client_id: ClientId,
        session: Session,
        reason: DetachReason,
    ) -> impl Future<Output = crate::Result<()>> + Send;

    /// Record a subscription, replacing any prior one with the same filter,
    /// and return the retained messages the filter matches.
    fn subscribe(
        &self,
        client_id: ClientId,
        subscriptions: &mut Subscriptions,
        filter: Filter,
        qos: QoS,
    ) -> impl Future<Output = crate::Result<Vec<Message>>> + Send;

    /// Drop a subscription; returns whether it existed.
    fn unsubscribe(
        &self,
        client_id: ClientId,
        subscriptions: &mut Subscriptions,
        filter: &Filter,
    ) -> impl Future<Output = crate::Result<bool>> + Send;

    /// Route a message: update the retained store if the message is retained,
    /// then deliver it to every matching session at
    /// `min(subscription QoS, message QoS)`.
    fn publish(&self, message: Message) -> impl Future<Output = crate::Result<()>> + Send;
}

type AuthHook = Box<dyn Fn(ClientId, Option<&Login>) -> bool + Send + Sync>;

/// The default process-local backend: everything lives under one coarse
/// mutex, which is only held for map and tree operations, never across I/O.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    auth: Option<AuthHook>,
}

struct Inner {
    clients: HashMap<ClientId, ClientState>,
    subscriptions: SubscriptionTree<ClientId, QoS>,
    retained: Tree<Message>,
}

struct ClientState {
    /// Fan-out handle into the session's mailbox. Stays valid while the
    /// session exists, attached or not.
    sender: MailSender,
    /// Cancellation token of the currently attached connection.
    attached: Option<CancellationToken>,
    /// The stored session while no connection is attached; `None` while a
    /// connection owns it.
    session: Option<Session>,
    /// Signalled each time a connection hands the session back.
    returned: Arc<Notify>,
}

enum TryAttach {
    Attached(Attached),
    /// The prior holder has been cancelled; wait for this before retrying.
    Busy(Arc<Notify>),
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            inner: Mutex::new(Inner {
                clients: HashMap::new(),
                subscriptions: SubscriptionTree::new(),
                retained: Tree::new(),
            }),
            auth: None,
        }
    }

    /// Install an authentication hook. Without one, every CONNECT is allowed.
    pub fn with_authenticator(
        hook: impl Fn(ClientId, Option<&Login>) -> bool + Send + Sync + 'static,
    ) -> Self {
        MemoryBackend {
            auth: Some(Box::new(hook)),
            ..Self::new()
        }
    }

    fn try_attach(
        inner: &mut Inner,
        client_id: ClientId,
        clean_session: bool,
        token: &CancellationToken,
    ) -> TryAttach {
        let state = match inner.clients.entry(client_id) {
            hash_map::Entry::Vacant(vacant) => {
                let session = Session::new(clean_session);

                vacant.insert(ClientState {
                    sender: session.mailbox.sender(),
                    attached: Some(token.clone()),
                    session: None,
                    returned: Arc::new(Notify::new()),
                });

                return TryAttach::Attached(Attached {
                    session,
                    session_present: false,
                });
            }
            hash_map::Entry::Occupied(occupied) => occupied.into_mut(),
        };

        if let Some(prior) = &state.attached {
            // Terminate the prior holder; the caller waits for it to detach.
            prior.cancel();
            tracing::debug!(%client_id, "session takeover, cancelling prior connection");

            return TryAttach::Busy(state.returned.clone());
        }

        let (session, session_present) = match (clean_session, state.session.take()) {
            (false, Some(session)) => {
                tracing::trace!(%client_id, "existing session was resumed");
                (session, true)
            }
            (false, None) => (Session::new(false), false),
            (true, stored) => {
                if let Some(stored) = &stored {
                    tracing::trace!(%client_id, "existing session was dropped");
                    for filter in stored.subscriptions.keys() {
                        inner.subscriptions.unsubscribe(filter, &client_id);
                    }
                }

                (Session::new(true), false)
            }
        };

        state.sender = session.mailbox.sender();
        state.attached = Some(token.clone());

        TryAttach::Attached(Attached {
            session,
            session_present,
        })
    }
}

impl Backend for MemoryBackend {
    async fn authenticate(
        &self,
        client_id: ClientId,
        login: Option<&Login>,
    ) -> crate::Result<bool> {
        Ok(self
            .auth
            .as_ref()
            .map_or(true, |hook| hook(client_id, login)))
    }

    async fn attach(
        &self,
        client_id: ClientId,
        clean_session: bool,
        token: CancellationToken,
    ) -> crate::Result<Attached> {
        loop {
            let returned = {
                let mut guard = self.inner.lock().await;

                match Self::try_attach(&mut guard, client_id, clean_session, &token) {
                    TryAttach::Attached(attached) => return Ok(attached),
                    TryAttach::Busy(returned) => returned,
                }
            };

            // Woken by `detach`; a permit is stored if the detach won the
            // race, so this cannot miss the signal.
            returned.notified().await;
        }
    }

    async fn detach(
        &self,
        client_id: ClientId,
        session: Session,
        reason: DetachReason,
    ) -> crate::Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let Some(state) = inner.clients.get_mut(&client_id) else {
            return Ok(());
        };

        state.attached = None;
        let returned = state.returned.clone();

        if session.clean {
            tracing::trace!(%client_id, ?reason, "clean session discarded");

            for filter in session.subscriptions.keys() {
                inner.subscriptions.unsubscribe(filter, &client_id);
            }

            inner.clients.remove(&client_id);
        } else {
            tracing::trace!(%client_id, ?reason, "session stored");
            state.session = Some(session);
        }

        returned.notify_one();

        Ok(())
    }

    async fn subscribe(
        &self,
        client_id: ClientId,
        subscriptions: &mut Subscriptions,
        filter: Filter,
        qos: QoS,
    ) -> crate::Result<Vec<Message>> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        inner.subscriptions.subscribe(&filter, client_id, qos);

        let mut retained = Vec::new();
        inner
            .retained
            .visit_search(&filter, &mut |message| retained.push(message.clone()));

        subscriptions.insert(filter, qos);

        Ok(retained)
    }

    async fn unsubscribe(
        &self,
        client_id: ClientId,
        subscriptions: &mut Subscriptions,
        filter: &Filter,
    ) -> crate::Result<bool> {
        let mut guard = self.inner.lock().await;

        let existed = guard.subscriptions.unsubscribe(filter, &client_id).is_some();
        subscriptions.remove(filter);

        Ok(existed)
    }

    async fn publish(&self, message: Message) -> crate::Result<()> {
        let topic = TopicName::parse(&message.topic)
            .map_err(|e| crate::Error::msg(format!("unroutable topic: {e}")))?;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if message.retain {
            let key = Filter::from_topic(&topic);

            if message.payload.is_empty() {
                // An empty retained payload clears the slot and is not
                // itself delivered to future subscribers [MQTT-3.3.1-10].
                inner.retained.remove(&key);
            } else {
                inner.retained.insert(&key, message.clone());
            }
        }

        // Deduplicate recipients, keeping the maximum QoS across all of their
        // matching filters [MQTT-3.3.5-1].
        let mut recipients = FnvHashMap::<ClientId, QoS>::default();
        inner.subscriptions.visit_matches(&topic, |client_id, qos| {
            recipients
                .entry(*client_id)
                .and_modify(|existing| *existing = (*existing).max(*qos))
                .or_insert(*qos);
        });

        for (client_id, qos) in recipients {
            if let Some(state) = inner.clients.get(&client_id) {
                // The RETAIN flag is zero when forwarding to an established
                // subscription [MQTT-3.3.1-9].
                if !state.sender.deliver(qos, false, message.clone()) {
                    tracing::trace!(%client_id, "dropping publish for vacated session");
                }
            }
        }

        Ok(())
    }
}
