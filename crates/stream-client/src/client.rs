//! The scope-multiplexed stream client.
//!
//! One [`StreamClient`] owns a table of scopes. Each scope has its own
//! transport, reconnect loop, envelope buffer and subscribers; scopes never
//! share state, so a failure on one agent's stream leaves the others alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info};

use agentdeck_protocol::{Frame, Scope};

use crate::config::{ConfigError, StreamConfig};
use crate::credentials::CredentialProvider;
use crate::error::StreamError;
use crate::reconnection;
use crate::slot::ScopeSlot;
use crate::subscription::{Subscriber, Subscription, dispatch_loop};
use crate::transport::{Connector, WsConnector};
use crate::types::{ConnectionState, Envelope, SendReceipt, StreamEvent};

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared state behind a [`StreamClient`], also held by its background tasks.
pub(crate) struct Inner {
    pub(crate) config: StreamConfig,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) credentials: Arc<dyn CredentialProvider>,
    scopes: Mutex<HashMap<Scope, Arc<Mutex<ScopeSlot>>>>,
    next_subscriber: AtomicU64,
}

impl Inner {
    pub(crate) fn slot(&self, scope: &Scope) -> Option<Arc<Mutex<ScopeSlot>>> {
        lock(&self.scopes).get(scope).cloned()
    }

    /// Returns the scope's slot, creating it (and its dispatcher) on first use.
    fn slot_or_create(&self, scope: &Scope) -> Arc<Mutex<ScopeSlot>> {
        let mut scopes = lock(&self.scopes);
        if let Some(slot) = scopes.get(scope) {
            return slot.clone();
        }

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(scope.clone(), dispatch_rx));
        let slot = Arc::new(Mutex::new(ScopeSlot::new(
            scope.clone(),
            self.config.buffer_capacity,
            self.config.outbound_capacity,
            dispatch_tx,
        )));
        scopes.insert(scope.clone(), slot.clone());
        debug!(scope = %scope, "scope created");
        slot
    }

    pub(crate) fn remove_subscriber(&self, scope: &Scope, id: u64) {
        if let Some(slot) = self.slot(scope) {
            lock(&slot).remove_subscriber(id);
        }
    }
}

/// Auto-reconnecting event stream client, multiplexed by [`Scope`].
///
/// None of the methods block or await; connection work happens on tokio
/// tasks, so the client must be used from within a tokio runtime.
/// Dropping the client disconnects every scope.
pub struct StreamClient {
    inner: Arc<Inner>,
}

impl StreamClient {
    /// Creates a client that opens real WebSockets.
    ///
    /// Fails when `config` does not pass [`StreamConfig::validate`].
    pub fn new(
        config: StreamConfig,
        credentials: impl CredentialProvider,
    ) -> Result<Self, ConfigError> {
        Self::with_connector(config, Arc::new(credentials), Arc::new(WsConnector::new()))
    }

    /// Creates a client on top of a custom transport.
    ///
    /// The configuration is validated here so no later call can trip over
    /// a zero capacity or an unusable endpoint.
    pub fn with_connector(
        config: StreamConfig,
        credentials: Arc<dyn CredentialProvider>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                credentials,
                scopes: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    /// Starts (or keeps) a connection for `scope`.
    ///
    /// A no-op while the scope is open or connecting. A scope waiting to
    /// reconnect retries immediately. Fails fast when the credential
    /// provider has no token; transport failures are never returned here,
    /// they show up as state changes.
    pub fn connect(&self, scope: &Scope) -> Result<(), StreamError> {
        if let Some(slot) = self.inner.slot(scope)
            && lock(&slot).state().is_active()
        {
            return Ok(());
        }

        self.inner.config.endpoint(scope)?;
        let token = self
            .inner
            .credentials
            .bearer_token()
            .ok_or(StreamError::Unauthenticated)?;

        let slot = self.inner.slot_or_create(scope);
        let attempt = lock(&slot).request_connect();
        if let Some(attempt) = attempt {
            info!(scope = %scope, generation = attempt.generation, "connecting");
            tokio::spawn(reconnection::run_attempt(
                self.inner.clone(),
                scope.clone(),
                attempt,
                token,
            ));
        }
        Ok(())
    }

    /// Closes `scope` and cancels any pending reconnect. The scope stays
    /// closed until `connect` is called again; its buffer is discarded.
    pub fn disconnect(&self, scope: &Scope) {
        if let Some(slot) = self.inner.slot(scope) {
            lock(&slot).disconnect();
        }
    }

    /// Sends a frame on `scope`, queueing it while the scope is not open.
    pub fn send(&self, scope: &Scope, frame: Frame) -> Result<SendReceipt, StreamError> {
        let slot = self
            .inner
            .slot(scope)
            .ok_or_else(|| StreamError::UnconnectedScope(scope.clone()))?;
        lock(&slot).send(frame)
    }

    /// Registers `callback` for every notification on `scope` from now on.
    ///
    /// Buffered envelopes are not replayed; read [`buffer_snapshot`] for
    /// history. Subscribing does not connect the scope.
    ///
    /// [`buffer_snapshot`]: StreamClient::buffer_snapshot
    pub fn subscribe<F>(&self, scope: &Scope, callback: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber::new(id, Arc::new(callback));
        let handle = Subscription::new(scope.clone(), &subscriber, Arc::downgrade(&self.inner));
        let slot = self.inner.slot_or_create(scope);
        lock(&slot).add_subscriber(subscriber);
        handle
    }

    /// Copy of the buffered envelopes of `scope`, oldest first.
    pub fn buffer_snapshot(&self, scope: &Scope) -> Vec<Envelope> {
        self.inner
            .slot(scope)
            .map(|slot| lock(&slot).snapshot())
            .unwrap_or_default()
    }

    /// Current state of `scope`, or `None` for an unknown scope.
    pub fn state(&self, scope: &Scope) -> Option<ConnectionState> {
        self.inner
            .slot(scope)
            .map(|slot| lock(&slot).state().clone())
    }

    /// Number of frames waiting for `scope` to open.
    pub fn pending_outbound(&self, scope: &Scope) -> usize {
        self.inner
            .slot(scope)
            .map(|slot| lock(&slot).queued_outbound())
            .unwrap_or(0)
    }

    /// Every scope the client knows about.
    pub fn scopes(&self) -> Vec<Scope> {
        let mut scopes: Vec<Scope> = lock(&self.inner.scopes).keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Disconnects and forgets every scope.
    pub fn shutdown(&self) {
        let slots: Vec<_> = lock(&self.inner.scopes).drain().collect();
        for (scope, slot) in slots {
            lock(&slot).disconnect();
            debug!(scope = %scope, "scope removed");
        }
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
