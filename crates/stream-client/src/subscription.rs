//! Subscriber registry entries, per-scope dispatch, and the unsubscribe handle.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tracing::warn;

use agentdeck_protocol::Scope;

use crate::client::Inner;
use crate::types::StreamEvent;

/// Callback invoked for every notification on a subscribed scope.
pub type EventCallback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// A registered callback.
#[derive(Clone)]
pub(crate) struct Subscriber {
    pub(crate) id: u64,
    callback: EventCallback,
    active: Arc<AtomicBool>,
}

impl Subscriber {
    pub(crate) fn new(id: u64, callback: EventCallback) -> Self {
        Self {
            id,
            callback,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// One notification plus the subscribers registered when it was produced.
pub(crate) struct Dispatch {
    pub(crate) event: StreamEvent,
    pub(crate) targets: Vec<Subscriber>,
}

/// Delivers notifications of one scope, in the order they were queued.
///
/// Runs until every sender (held by the scope) is gone. Callbacks run here,
/// outside any scope lock, so they may call back into the client.
pub(crate) async fn dispatch_loop(scope: Scope, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
    while let Some(dispatch) = rx.recv().await {
        for target in &dispatch.targets {
            if !target.active.load(Ordering::Acquire) {
                continue;
            }
            let delivered = catch_unwind(AssertUnwindSafe(|| (target.callback)(&dispatch.event)));
            if delivered.is_err() {
                warn!(scope = %scope, subscriber = target.id, "subscriber callback panicked");
            }
        }
    }
}

/// Handle returned by [`StreamClient::subscribe`](crate::StreamClient::subscribe).
///
/// Dropping it (or calling [`Subscription::unsubscribe`]) removes the
/// callback. Removing the last subscriber does not disconnect the scope.
#[must_use = "dropping a Subscription unsubscribes its callback"]
pub struct Subscription {
    scope: Scope,
    id: u64,
    active: Arc<AtomicBool>,
    client: Option<Weak<Inner>>,
}

impl Subscription {
    pub(crate) fn new(scope: Scope, subscriber: &Subscriber, client: Weak<Inner>) -> Self {
        Self {
            scope,
            id: subscriber.id,
            active: subscriber.active.clone(),
            client: Some(client),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Stops delivery to the callback. Notifications already queued for it
    /// are skipped.
    pub fn unsubscribe(self) {}

    /// Keeps the callback registered for the lifetime of the client.
    pub fn detach(mut self) {
        self.client = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        self.active.store(false, Ordering::Release);
        if let Some(inner) = client.upgrade() {
            inner.remove_subscriber(&self.scope, self.id);
        }
    }
}
