//! Multiplexer session: one per client connection.
//!
//! The session decodes client envelopes, fans requests out through an
//! [`Executor`], and writes tagged responses back on a single outbound
//! channel. All state is owned here and touched from one task, so handlers
//! and upstream callbacks never interleave.

use crate::config::SessionConfig;
use crate::envelope::{self, DecodeError, HANDLE_NOTICE, Request, Verb};
use crate::executor::{Callback, CallbackKind, Cancel, Executor, FanoutTarget, HandleId, Listener};
use crate::registry::{SubscriptionHandle, SubscriptionRegistry};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Reason logged when a client sends a binary frame.
pub const BINARY_FRAME: &str = "binary frames are not supported";

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// Terminal
    Closed,
}

/// Something the session must react to besides client frames
#[derive(Debug)]
pub enum SessionEvent {
    /// A relay reported back
    Upstream(Callback),
    /// A publish reached its timeout
    PublishExpired(HandleId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionKind {
    Req,
    Count,
}

/// What a live handle is serving
#[derive(Debug)]
enum Route {
    Subscription {
        sub_id: String,
        kind: SubscriptionKind,
    },
    Publish,
}

struct PublishHandle {
    event_id: String,
    pending: HashSet<String>,
    cancel: Cancel,
    timer: JoinHandle<()>,
}

impl PublishHandle {
    fn finish(self) {
        self.timer.abort();
        self.cancel.cancel();
    }
}

/// Per-connection multiplexer
pub struct Multiplexer<E: Executor> {
    executor: E,
    config: SessionConfig,
    state: SessionState,
    error_count: u32,
    next_handle: u64,
    subscriptions: SubscriptionRegistry,
    publishes: HashMap<HandleId, PublishHandle>,
    routes: HashMap<HandleId, Route>,
    outbound: mpsc::UnboundedSender<String>,
    inbox_tx: mpsc::UnboundedSender<Callback>,
    inbox_rx: mpsc::UnboundedReceiver<Callback>,
    expired_tx: mpsc::UnboundedSender<HandleId>,
    expired_rx: mpsc::UnboundedReceiver<HandleId>,
}

impl<E: Executor> Multiplexer<E> {
    /// Create a session. Frames for the client arrive on the returned receiver.
    pub fn new(executor: E, config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();

        let session = Self {
            executor,
            config,
            state: SessionState::Open,
            error_count: 0,
            next_handle: 0,
            subscriptions: SubscriptionRegistry::new(),
            publishes: HashMap::new(),
            routes: HashMap::new(),
            outbound,
            inbox_tx,
            inbox_rx,
            expired_tx,
            expired_rx,
        };

        (session, outbound_rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Decode failures so far
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn publish_count(&self) -> usize {
        self.publishes.len()
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Handle one text frame from the client.
    pub fn handle_text(&mut self, text: &str) {
        if self.is_closed() {
            return;
        }

        if text.len() > self.config.max_message_size {
            self.reject_frame(&format!(
                "frame of {} bytes exceeds {}",
                text.len(),
                self.config.max_message_size
            ));
            return;
        }

        match envelope::decode(text).and_then(|envelope| envelope.into_request()) {
            Ok((relays, request)) => self.dispatch(relays, request),
            Err(e) => self.decode_failed(&e),
        }

        self.enforce_error_limit();
    }

    /// Count a frame the gateway cannot read at all (binary, oversized).
    pub fn reject_frame(&mut self, reason: &str) {
        if self.is_closed() {
            return;
        }
        self.decode_failed(&DecodeError::Read(reason.to_string()));
        self.enforce_error_limit();
    }

    /// Wait for the next upstream callback or publish expiry.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        tokio::select! {
            Some(callback) = self.inbox_rx.recv() => Some(SessionEvent::Upstream(callback)),
            Some(handle) = self.expired_rx.recv() => Some(SessionEvent::PublishExpired(handle)),
            else => None,
        }
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Upstream(callback) => self.handle_callback(callback),
            SessionEvent::PublishExpired(handle) => self.expire_publish(handle),
        }
    }

    /// Tear the session down: cancel every request and close the pool.
    /// Later calls do nothing.
    pub fn cleanup(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = SessionState::Closed;

        self.subscriptions.clear();
        for (_, publish) in self.publishes.drain() {
            publish.finish();
        }
        self.routes.clear();
        self.executor.clear();
        debug!("Session cleaned up after {} decode errors", self.error_count);
    }

    fn decode_failed(&mut self, err: &DecodeError) {
        self.error_count += 1;
        debug!("Decode failure #{}: {}", self.error_count, err);
        self.send_notice(err.notice());
    }

    // Spurious clients that point a raw relay connection at the gateway
    // produce nothing but decode failures.
    fn enforce_error_limit(&mut self) {
        if self.error_count > self.config.max_decode_errors && !self.is_closed() {
            info!("Closing connection due to errors");
            self.cleanup();
        }
    }

    fn dispatch(&mut self, relays: Vec<String>, request: Request) {
        match request {
            Request::Req { sub_id, filters } => {
                self.open_subscription(relays, sub_id, filters, SubscriptionKind::Req)
            }
            Request::Count { sub_id, filters } => {
                self.open_subscription(relays, sub_id, filters, SubscriptionKind::Count)
            }
            Request::Close { sub_id } => self.close_subscription(&sub_id),
            Request::Event(event) => self.publish(relays, Verb::Event, event),
            Request::Auth(event) => self.publish(relays, Verb::Auth, event),
            Request::Unhandled(verb) => {
                debug!("Unhandled verb {:?}", verb);
                self.send_notice(HANDLE_NOTICE);
            }
        }
    }

    fn open_subscription(
        &mut self,
        relays: Vec<String>,
        sub_id: String,
        filters: Vec<Value>,
        kind: SubscriptionKind,
    ) {
        // The old handle must be gone before the new one can deliver anything.
        self.close_subscription(&sub_id);

        let handle = self.allocate_handle();
        let listener = self.listener(handle);
        let target = self.executor.resolve(&relays);
        debug!(
            "{:?} {} over {} relays as {}",
            kind,
            sub_id,
            target.relays().len(),
            handle
        );

        let auth = self.executor.handle_auth(&target, listener.clone());
        let upstream = match kind {
            SubscriptionKind::Req => self.executor.subscribe(&target, filters, listener),
            SubscriptionKind::Count => self.executor.count(&target, filters, listener),
        };
        let cancel = upstream.then(move || {
            auth.cancel();
            target.release();
        });

        self.routes.insert(
            handle,
            Route::Subscription {
                sub_id: sub_id.clone(),
                kind,
            },
        );
        self.subscriptions
            .set(sub_id, SubscriptionHandle::new(handle, cancel));
    }

    fn close_subscription(&mut self, sub_id: &str) {
        if let Some(existing) = self.subscriptions.get(sub_id) {
            self.routes.remove(&existing.id());
        }
        if self.subscriptions.cancel_and_remove(sub_id) {
            debug!("Closed subscription {}", sub_id);
        }
    }

    fn publish(&mut self, relays: Vec<String>, verb: Verb, event: Value) {
        let event_id = event
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let handle = self.allocate_handle();
        let listener = self.listener(handle);
        let target = self.executor.resolve(&relays);
        let pending: HashSet<String> = target.relays().into_iter().collect();

        if pending.is_empty() {
            debug!("{} {} has no reachable relays", verb.as_str(), event_id);
            target.release();
            return;
        }

        let auth = self.executor.handle_auth(&target, listener.clone());
        let upstream = self.executor.publish(&target, verb, event, listener);
        let cancel = upstream.then(move || {
            auth.cancel();
            target.release();
        });

        let expired = self.expired_tx.clone();
        let publish_timeout = self.config.publish_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(publish_timeout).await;
            let _ = expired.send(handle);
        });

        debug!(
            "{} {} to {} relays as {}",
            verb.as_str(),
            event_id,
            pending.len(),
            handle
        );
        self.routes.insert(handle, Route::Publish);
        self.publishes.insert(
            handle,
            PublishHandle {
                event_id,
                pending,
                cancel,
                timer,
            },
        );
    }

    fn expire_publish(&mut self, handle: HandleId) {
        if let Some(publish) = self.publishes.remove(&handle) {
            debug!(
                "Publish {} timed out with {} relays silent",
                publish.event_id,
                publish.pending.len()
            );
            self.routes.remove(&handle);
            publish.finish();
        }
    }

    fn handle_callback(&mut self, callback: Callback) {
        if self.is_closed() {
            return;
        }

        let Callback { handle, relay, kind } = callback;

        let (sub_id, sub_kind) = match self.routes.get(&handle) {
            Some(Route::Subscription {
                sub_id,
                kind: route_kind,
            }) => (Some(sub_id.clone()), Some(*route_kind)),
            Some(Route::Publish) => (None, None),
            None => {
                trace!("Dropping callback for released handle {}", handle);
                return;
            }
        };

        match kind {
            CallbackKind::Auth(challenge) => self.send(&relay, json!(["AUTH", challenge])),
            CallbackKind::Ok {
                event_id,
                accepted,
                message,
            } => {
                self.acknowledge(handle, &relay, &event_id);
                self.send(&relay, json!(["OK", event_id, accepted, message]));
            }
            CallbackKind::Error(args) => {
                let event_id = args
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.acknowledge(handle, &relay, &event_id);

                let mut message = vec![json!("ERROR")];
                message.extend(args);
                self.send(&relay, Value::Array(message));
            }
            CallbackKind::Event(event) => {
                let Some(sub_id) = sub_id else { return };
                self.forward_event(handle, &relay, sub_id, event);
            }
            CallbackKind::Eose => {
                if let (Some(sub_id), Some(SubscriptionKind::Req)) = (sub_id, sub_kind) {
                    self.send(&relay, json!(["EOSE", sub_id]));
                }
            }
            CallbackKind::Count(payload) => {
                if let Some(sub_id) = sub_id {
                    let mut message = vec![json!("COUNT"), json!(sub_id)];
                    message.extend(payload);
                    self.send(&relay, Value::Array(message));
                }
            }
            CallbackKind::Closed(reason) => {
                if let Some(sub_id) = sub_id {
                    self.send(&relay, json!(["CLOSED", sub_id, reason]));
                }
            }
        }
    }

    fn forward_event(&mut self, handle: HandleId, relay: &str, sub_id: String, event: Value) {
        let Some(subscription) = self.subscriptions.get_active(&sub_id, handle) else {
            return;
        };

        let Some(event_id) = event.get("id").and_then(Value::as_str) else {
            debug!("Dropping event without id from {}", relay);
            return;
        };

        if subscription.first_sighting(event_id) {
            self.send(relay, json!(["EVENT", sub_id, event]));
        }
    }

    fn acknowledge(&mut self, handle: HandleId, relay: &str, event_id: &str) {
        let done = match self.publishes.get_mut(&handle) {
            Some(publish) if publish.event_id == event_id => {
                publish.pending.remove(relay);
                publish.pending.is_empty()
            }
            _ => false,
        };

        if done {
            self.routes.remove(&handle);
            if let Some(publish) = self.publishes.remove(&handle) {
                trace!("Publish {} acknowledged by every relay", publish.event_id);
                publish.finish();
            }
        }
    }

    fn allocate_handle(&mut self) -> HandleId {
        self.next_handle += 1;
        HandleId(self.next_handle)
    }

    fn listener(&self, handle: HandleId) -> Listener {
        Listener::new(handle, self.inbox_tx.clone())
    }

    fn send(&self, relay: &str, message: Value) {
        let _ = self.outbound.send(envelope::encode(&[relay], message));
    }

    fn send_notice(&self, text: &str) {
        let _ = self.outbound.send(envelope::notice(text));
    }
}

impl<E: Executor> Drop for Multiplexer<E> {
    fn drop(&mut self) {
        self.cleanup();
    }
}
