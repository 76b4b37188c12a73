//! Fan-out executor contract.
//!
//! An executor turns one logical subscribe/publish/count into one request per
//! upstream relay. Results come back as [`Callback`]s on the session inbox,
//! each stamped with the [`HandleId`] of the request that asked for them. The
//! session discards callbacks for handles it no longer holds, so a cancelled
//! request goes quiet as soon as its [`Cancel`] has run.

use crate::envelope::Verb;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

/// Identifies one outstanding request within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// What an upstream relay reported
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackKind {
    /// A stored or live event matched a subscription
    Event(Value),
    /// The relay has sent all stored events
    Eose,
    /// The relay ended a subscription
    Closed(String),
    /// Publish acknowledgement
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// The publish could not be delivered
    Error(Vec<Value>),
    /// COUNT reply payload
    Count(Vec<Value>),
    /// Authentication challenge
    Auth(String),
}

/// One upstream report addressed to a request handle.
#[derive(Debug, Clone, PartialEq)]
pub struct Callback {
    pub handle: HandleId,
    pub relay: String,
    pub kind: CallbackKind,
}

/// Delivers callbacks for a single request handle to its session.
#[derive(Debug, Clone)]
pub struct Listener {
    handle: HandleId,
    tx: mpsc::UnboundedSender<Callback>,
}

impl Listener {
    pub fn new(handle: HandleId, tx: mpsc::UnboundedSender<Callback>) -> Self {
        Self { handle, tx }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn on_event(&self, relay: &str, event: Value) {
        self.emit(relay, CallbackKind::Event(event));
    }

    pub fn on_eose(&self, relay: &str) {
        self.emit(relay, CallbackKind::Eose);
    }

    pub fn on_closed(&self, relay: &str, message: String) {
        self.emit(relay, CallbackKind::Closed(message));
    }

    pub fn on_ok(&self, relay: &str, event_id: String, accepted: bool, message: String) {
        self.emit(
            relay,
            CallbackKind::Ok {
                event_id,
                accepted,
                message,
            },
        );
    }

    pub fn on_error(&self, relay: &str, args: Vec<Value>) {
        self.emit(relay, CallbackKind::Error(args));
    }

    pub fn on_count(&self, relay: &str, payload: Vec<Value>) {
        self.emit(relay, CallbackKind::Count(payload));
    }

    pub fn on_auth(&self, relay: &str, challenge: String) {
        self.emit(relay, CallbackKind::Auth(challenge));
    }

    fn emit(&self, relay: &str, kind: CallbackKind) {
        // A closed inbox means the session is gone; nothing left to notify.
        let _ = self.tx.send(Callback {
            handle: self.handle,
            relay: relay.to_string(),
            kind,
        });
    }
}

/// Deferred cleanup for an upstream request. Runs at most once.
#[must_use = "dropping a Cancel leaks the upstream request"]
pub struct Cancel(Option<Box<dyn FnOnce() + Send>>);

impl Cancel {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Cancel(Some(Box::new(f)))
    }

    /// A cancel that does nothing
    pub fn noop() -> Self {
        Cancel(None)
    }

    /// Chain another cleanup step after this one.
    pub fn then<F>(self, next: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Cancel::new(move || {
            self.cancel();
            next();
        })
    }

    pub fn cancel(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl fmt::Debug for Cancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cancel")
            .field(&if self.0.is_some() { "pending" } else { "noop" })
            .finish()
    }
}

/// The set of upstream connections one request fans out over.
pub trait FanoutTarget: Send + 'static {
    /// URLs of the connections in this target
    fn relays(&self) -> Vec<String>;

    /// Return every connection handle to the pool. Consuming `self` makes
    /// this happen exactly once.
    fn release(self);
}

/// Fan-out over a session's upstream connections.
pub trait Executor: Send + 'static {
    type Target: FanoutTarget;

    /// Acquire connections for `relays` and build a target over them.
    fn resolve(&mut self, relays: &[String]) -> Self::Target;

    /// Send `REQ` to every relay in the target.
    fn subscribe(&mut self, target: &Self::Target, filters: Vec<Value>, listener: Listener)
    -> Cancel;

    /// Send `verb` (`EVENT` or `AUTH`) with `event` to every relay in the target.
    fn publish(
        &mut self,
        target: &Self::Target,
        verb: Verb,
        event: Value,
        listener: Listener,
    ) -> Cancel;

    /// Send `COUNT` to every relay in the target.
    fn count(&mut self, target: &Self::Target, filters: Vec<Value>, listener: Listener) -> Cancel;

    /// Forward authentication challenges from the target's relays.
    fn handle_auth(&mut self, target: &Self::Target, listener: Listener) -> Cancel;

    /// Close every upstream connection. Called once, at session teardown.
    fn clear(&mut self);
}
