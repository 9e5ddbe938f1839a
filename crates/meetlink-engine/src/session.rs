//! # Transport Session
//!
//! Owns the physical connection of one publisher or subscriber. `connect()`
//! dials through a [`Connector`] (retrying per the backoff policy) and binds
//! the channel registry to the result; a supervisor task then watches the
//! connection and drives reconnects. Lifecycle changes are published as
//! [`SessionEvent`]s on a broadcast channel plus a boolean health signal.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::error::{TransportError, TransportErrorKind};
use crate::registry::ChannelRegistry;
use crate::transport::{Connection, Connector};
use crate::util::lock_or_recover;
use meetlink_transport::reconnect::{
    BackoffPolicy, ConnectionState, FailureAction, ReconnectController, SessionEvent,
};

const EVENT_CAPACITY: usize = 64;

struct SessionInner {
    connector: Arc<dyn Connector>,
    registry: ChannelRegistry,
    controller: Mutex<ReconnectController>,
    events: broadcast::Sender<SessionEvent>,
    health: watch::Sender<bool>,
    stop: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionInner {
    fn emit(&self, event: Option<SessionEvent>) {
        let Some(event) = event else {
            return;
        };
        match &event {
            SessionEvent::Connected | SessionEvent::Reconnected => tracing::info!(?event, "session open"),
            SessionEvent::Reconnecting { attempt, max_attempts, delay } => {
                tracing::warn!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, "session reconnecting")
            }
            SessionEvent::ReconnectionFailed { reason } => tracing::warn!(%reason, "session failed"),
            _ => tracing::debug!(?event, "session event"),
        }
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Dial and bind. The connection is closed again if binding fails.
    async fn establish(&self) -> Result<Arc<dyn Connection>, TransportError> {
        let connection = self.connector.connect().await?;
        if let Err(e) = self.registry.bind(connection.clone()).await {
            connection.close().await;
            return Err(e);
        }
        Ok(connection)
    }

    fn fail(&self, err: &TransportError) -> FailureAction {
        let mut controller = lock_or_recover(&self.controller);
        if err.kind == TransportErrorKind::Protocol {
            let event = controller.on_fatal(err.to_string());
            drop(controller);
            self.emit(event);
            return FailureAction::GiveUp;
        }
        let (action, event) = controller.on_failure(err.message_opt());
        drop(controller);
        self.emit(event);
        action
    }

    fn opened(&self) -> bool {
        let event = lock_or_recover(&self.controller).on_open();
        let opened = event.is_some();
        self.emit(event);
        if opened {
            self.health.send_replace(true);
        }
        opened
    }

    /// Sleep for a backoff delay; false if the session was stopped meanwhile.
    async fn backoff(&self, delay: Duration) -> bool {
        let mut stop = self.stop.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.wait_for(|s| *s) => return false,
        }
        if self.stopped() {
            return false;
        }
        let event = lock_or_recover(&self.controller).begin_retry();
        self.emit(event);
        true
    }
}

/// One connection's lifecycle plus its channel registry.
pub struct TransportSession {
    inner: Arc<SessionInner>,
}

impl TransportSession {
    pub fn new(connector: Arc<dyn Connector>, registry: ChannelRegistry, policy: BackoffPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (health, _) = watch::channel(false);
        let (stop, _) = watch::channel(false);
        TransportSession {
            inner: Arc::new(SessionInner {
                connector,
                registry,
                controller: Mutex::new(ReconnectController::new(policy)),
                events,
                health,
                stop,
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.inner.registry
    }

    pub fn state(&self) -> ConnectionState {
        lock_or_recover(&self.inner.controller).state()
    }

    pub fn attempt(&self) -> u32 {
        lock_or_recover(&self.inner.controller).attempt()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// `true` while the connection is open.
    pub fn health(&self) -> watch::Receiver<bool> {
        self.inner.health.subscribe()
    }

    /// Connect, retrying retriable failures with backoff. Resolves once the
    /// session is open, or with the last error once it has failed.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        {
            let mut controller = lock_or_recover(&inner.controller);
            if controller.is_open() {
                return Ok(());
            }
            let event = controller.connect();
            if event.is_none() {
                return Err(TransportError::protocol(format!(
                    "connect while {:?}",
                    controller.state()
                )));
            }
            drop(controller);
            inner.stop.send_replace(false);
            inner.emit(event);
        }

        loop {
            match inner.establish().await {
                Ok(connection) => {
                    if !inner.opened() {
                        // Disconnected while dialing.
                        connection.close().await;
                        return Err(TransportError::closed("session closed while connecting"));
                    }
                    let supervisor = tokio::spawn(supervise(inner.clone(), connection));
                    if let Some(old) = lock_or_recover(&inner.supervisor).replace(supervisor) {
                        old.abort();
                    }
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(error = %e, "connect attempt failed");
                    match inner.fail(&e) {
                        FailureAction::Retry { delay, .. } => {
                            if !inner.backoff(delay).await {
                                return Err(TransportError::closed("session closed while reconnecting"));
                            }
                        }
                        FailureAction::GiveUp | FailureAction::Ignore => return Err(e),
                    }
                }
            }
        }
    }

    /// Close the session: flush and close channels, then release the
    /// connection. Safe to call in any state, and more than once.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let event = lock_or_recover(&inner.controller).disconnect();
        inner.emit(event);
        inner.stop.send_replace(true);
        if let Some(supervisor) = lock_or_recover(&inner.supervisor).take() {
            supervisor.abort();
        }

        let connection = inner.registry.connection();
        inner.registry.close_all();
        if let Some(connection) = connection {
            connection.close().await;
        }
        inner.health.send_replace(false);
        let event = lock_or_recover(&inner.controller).on_closed(None);
        inner.emit(event);
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.inner.stop.send_replace(true);
        if let Some(supervisor) = lock_or_recover(&self.inner.supervisor).take() {
            supervisor.abort();
        }
    }
}

/// Watch the open connection; on loss, reconnect per the controller.
async fn supervise(inner: Arc<SessionInner>, mut connection: Arc<dyn Connection>) {
    let mut stop = inner.stop.subscribe();
    loop {
        let reason = tokio::select! {
            reason = connection.closed() => reason,
            _ = stop.wait_for(|s| *s) => return,
        };
        if inner.stopped() {
            return;
        }

        tracing::info!(?reason, "connection lost");
        inner.registry.unbind();
        inner.health.send_replace(false);

        let (mut action, event) = lock_or_recover(&inner.controller).on_failure(reason.message());
        inner.emit(event);

        loop {
            let FailureAction::Retry { delay, .. } = action else {
                return;
            };
            if !inner.backoff(delay).await {
                return;
            }
            match inner.establish().await {
                Ok(next) => {
                    if !inner.opened() {
                        next.close().await;
                        return;
                    }
                    connection = next;
                    break;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "reconnect attempt failed");
                    action = inner.fail(&e);
                }
            }
        }
    }
}
