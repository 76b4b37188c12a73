//! Single upstream relay connection.
//!
//! A connection owns one websocket and a background task that writes queued
//! frames and routes relay replies to the listeners registered on it.
//! Frames queued before the handshake finishes are sent once it does.

use crate::error::{MultiplexerError, Result, is_benign};
use crate::executor::{HandleId, Listener};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress
    Connecting,
    /// Connected and ready
    Connected,
    /// Closed by the session or lost
    Closed,
}

/// Message received from a relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// ["EVENT", subscription_id, event]
    Event(String, Value),
    /// ["EOSE", subscription_id]
    Eose(String),
    /// ["CLOSED", subscription_id, message]
    Closed(String, String),
    /// ["OK", event_id, accepted, message]
    Ok(String, bool, String),
    /// ["NOTICE", message]
    Notice(String),
    /// ["AUTH", challenge]
    Auth(String),
    /// ["COUNT", subscription_id, payload...]
    Count(String, Vec<Value>),
}

impl RelayMessage {
    /// Parse a relay frame. Unknown message types yield `None`.
    pub fn from_json(text: &str) -> Result<Option<Self>> {
        let value: Value = serde_json::from_str(text)?;
        let arr = value
            .as_array()
            .ok_or_else(|| MultiplexerError::Protocol("relay message must be an array".into()))?;

        let Some(msg_type) = arr.first().and_then(Value::as_str) else {
            return Err(MultiplexerError::Protocol(
                "relay message type must be a string".into(),
            ));
        };

        let string_at = |i: usize, what: &str| -> Result<String> {
            arr.get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    MultiplexerError::Protocol(format!("{} {} must be a string", msg_type, what))
                })
        };

        let message = match msg_type {
            "EVENT" => {
                let sub_id = string_at(1, "subscription_id")?;
                let event = arr.get(2).cloned().ok_or_else(|| {
                    MultiplexerError::Protocol("EVENT message requires an event".into())
                })?;
                RelayMessage::Event(sub_id, event)
            }
            "EOSE" => RelayMessage::Eose(string_at(1, "subscription_id")?),
            "CLOSED" => RelayMessage::Closed(
                string_at(1, "subscription_id")?,
                arr.get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
            "OK" => {
                let event_id = string_at(1, "event_id")?;
                let accepted = arr
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| {
                        MultiplexerError::Protocol("OK accepted field must be a boolean".into())
                    })?;
                let message = arr
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                RelayMessage::Ok(event_id, accepted, message)
            }
            "NOTICE" => RelayMessage::Notice(string_at(1, "message")?),
            "AUTH" => RelayMessage::Auth(string_at(1, "challenge")?),
            "COUNT" => RelayMessage::Count(string_at(1, "subscription_id")?, arr[2..].to_vec()),
            _ => return Ok(None),
        };

        Ok(Some(message))
    }
}

/// Unique id for a REQ/COUNT on a shared upstream connection.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Default)]
struct Routes {
    subscriptions: HashMap<String, Listener>,
    publishes: HashMap<String, Vec<Listener>>,
    auth: HashMap<HandleId, Listener>,
}

struct Shared {
    state: ConnectionState,
    routes: Routes,
}

enum Outbound {
    Frame(String),
    Shutdown,
}

/// Connection to one upstream relay
pub struct RelayConnection {
    url: String,
    shared: Arc<Mutex<Shared>>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl RelayConnection {
    /// Start connecting to `url` in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(url: &str, connect_timeout: Duration) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Shared {
            state: ConnectionState::Connecting,
            routes: Routes::default(),
        }));

        tokio::spawn(run_connection(
            url.to_string(),
            Arc::clone(&shared),
            outbound_rx,
            connect_timeout,
        ));

        Arc::new(Self {
            url: url.to_string(),
            shared,
            outbound,
        })
    }

    /// Relay URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Open a REQ on this relay. Returns the upstream subscription id.
    pub fn subscribe(&self, filters: &[Value], listener: Listener) -> String {
        self.open_subscription("REQ", filters, listener)
    }

    /// Send a COUNT on this relay. Returns the upstream subscription id.
    pub fn count(&self, filters: &[Value], listener: Listener) -> String {
        self.open_subscription("COUNT", filters, listener)
    }

    fn open_subscription(&self, verb: &str, filters: &[Value], listener: Listener) -> String {
        let sub_id = generate_subscription_id();
        {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Closed {
                listener.on_closed(&self.url, "error: relay connection closed".into());
                return sub_id;
            }
            shared
                .routes
                .subscriptions
                .insert(sub_id.clone(), listener);
        }

        let mut frame = vec![json!(verb), json!(sub_id)];
        frame.extend(filters.iter().cloned());
        self.send(Value::Array(frame).to_string());
        sub_id
    }

    /// Stop routing a REQ/COUNT and tell the relay to close it.
    pub fn close_subscription(&self, sub_id: &str) {
        let removed = self.shared.lock().routes.subscriptions.remove(sub_id);
        if removed.is_some() {
            self.send(json!(["CLOSE", sub_id]).to_string());
        }
    }

    /// Send an EVENT or AUTH frame and wait for the relay's OK.
    pub fn publish(&self, verb: &str, event: &Value, listener: Listener) {
        let Some(event_id) = event.get("id").and_then(Value::as_str).map(str::to_string) else {
            listener.on_error(&self.url, vec![json!(""), json!("invalid: event has no id")]);
            return;
        };

        {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Closed {
                listener.on_error(
                    &self.url,
                    vec![json!(event_id), json!("error: relay connection closed")],
                );
                return;
            }
            shared
                .routes
                .publishes
                .entry(event_id)
                .or_default()
                .push(listener);
        }

        self.send(json!([verb, event]).to_string());
    }

    /// Stop waiting for acknowledgements on behalf of `handle`.
    pub fn forget_publish(&self, event_id: &str, handle: HandleId) {
        let mut shared = self.shared.lock();
        if let Some(listeners) = shared.routes.publishes.get_mut(event_id) {
            listeners.retain(|l| l.handle() != handle);
            if listeners.is_empty() {
                shared.routes.publishes.remove(event_id);
            }
        }
    }

    /// Route authentication challenges to `listener`.
    pub fn add_auth_listener(&self, listener: Listener) {
        self.shared
            .lock()
            .routes
            .auth
            .insert(listener.handle(), listener);
    }

    pub fn remove_auth_listener(&self, handle: HandleId) {
        self.shared.lock().routes.auth.remove(&handle);
    }

    /// Number of live routes, for diagnostics and tests.
    pub fn route_count(&self) -> usize {
        let shared = self.shared.lock();
        shared.routes.subscriptions.len()
            + shared.routes.publishes.values().map(Vec::len).sum::<usize>()
            + shared.routes.auth.len()
    }

    /// Close the socket and drop every route without notifying listeners.
    pub fn close(&self) {
        {
            let mut shared = self.shared.lock();
            shared.state = ConnectionState::Closed;
            shared.routes = Routes::default();
        }
        let _ = self.outbound.send(Outbound::Shutdown);
    }

    fn send(&self, frame: String) {
        trace!("Queueing frame for {}: {}", self.url, frame);
        let _ = self.outbound.send(Outbound::Frame(frame));
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        let _ = self.outbound.send(Outbound::Shutdown);
    }
}

async fn run_connection(
    url: String,
    shared: Arc<Mutex<Shared>>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    connect_timeout: Duration,
) {
    let ws_stream = match timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((ws_stream, _))) => ws_stream,
        Ok(Err(e)) => {
            fail(&url, &shared, &e.to_string());
            return;
        }
        Err(_) => {
            fail(&url, &shared, "connection timed out");
            return;
        }
    };

    {
        let mut guard = shared.lock();
        if guard.state == ConnectionState::Closed {
            return;
        }
        guard.state = ConnectionState::Connected;
    }
    debug!("Connected to relay {}", url);

    let (mut write, mut read) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = write.send(Message::text(frame)).await {
                            break e.to_string();
                        }
                    }
                    Some(Outbound::Shutdown) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        debug!("Closed relay connection {}", url);
                        return;
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch(&url, &shared, text.as_str()),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break "relay closed the connection".to_string();
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                }
            }
        }
    };

    fail(&url, &shared, &reason);
}

fn dispatch(url: &str, shared: &Mutex<Shared>, text: &str) {
    let message = match RelayMessage::from_json(text) {
        Ok(Some(message)) => message,
        Ok(None) => {
            trace!("Ignoring unknown message from {}: {}", url, text);
            return;
        }
        Err(e) => {
            debug!("Malformed message from {}: {}", url, e);
            return;
        }
    };

    let mut guard = shared.lock();
    let routes = &mut guard.routes;

    match message {
        RelayMessage::Event(sub_id, event) => {
            if let Some(listener) = routes.subscriptions.get(&sub_id) {
                listener.on_event(url, event);
            }
        }
        RelayMessage::Eose(sub_id) => {
            if let Some(listener) = routes.subscriptions.get(&sub_id) {
                listener.on_eose(url);
            }
        }
        RelayMessage::Closed(sub_id, message) => {
            if let Some(listener) = routes.subscriptions.remove(&sub_id) {
                listener.on_closed(url, message);
            }
        }
        RelayMessage::Count(sub_id, payload) => {
            if let Some(listener) = routes.subscriptions.get(&sub_id) {
                listener.on_count(url, payload);
            }
        }
        RelayMessage::Ok(event_id, accepted, message) => {
            // One OK answers one queued publish, oldest first.
            let listener = match routes.publishes.get_mut(&event_id) {
                Some(listeners) if !listeners.is_empty() => {
                    let listener = listeners.remove(0);
                    if listeners.is_empty() {
                        routes.publishes.remove(&event_id);
                    }
                    Some(listener)
                }
                // Acknowledgements nobody published through us belong to
                // auth, and every auth listener on a connection reports to
                // the same client, so one copy per frame.
                _ => routes.auth.values().min_by_key(|l| l.handle()).cloned(),
            };
            if let Some(listener) = listener {
                listener.on_ok(url, event_id, accepted, message);
            }
        }
        RelayMessage::Auth(challenge) => {
            if let Some(listener) = routes.auth.values().min_by_key(|l| l.handle()) {
                listener.on_auth(url, challenge);
            }
        }
        RelayMessage::Notice(notice) => {
            debug!("Notice from {}: {}", url, notice);
        }
    }
}

fn fail(url: &str, shared: &Mutex<Shared>, reason: &str) {
    if is_benign(reason) {
        debug!("Relay connection {} failed: {}", url, reason);
    } else {
        warn!("Relay connection {} failed: {}", url, reason);
    }

    let routes = {
        let mut guard = shared.lock();
        if guard.state == ConnectionState::Closed {
            return;
        }
        guard.state = ConnectionState::Closed;
        std::mem::take(&mut guard.routes)
    };

    let closed = format!("error: {}", reason);
    for listener in routes.subscriptions.into_values() {
        listener.on_closed(url, closed.clone());
    }
    for (event_id, listeners) in routes.publishes {
        for listener in listeners {
            listener.on_error(url, vec![json!(event_id), json!(closed)]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Callback, CallbackKind};

    #[test]
    fn test_parse_event() {
        let msg = RelayMessage::from_json(r#"["EVENT","abc",{"id":"e1"}]"#)
            .unwrap()
            .unwrap();
        assert_eq!(msg, RelayMessage::Event("abc".into(), json!({"id": "e1"})));
    }

    #[test]
    fn test_parse_ok_and_count() {
        let msg = RelayMessage::from_json(r#"["OK","e1",false,"blocked: spam"]"#)
            .unwrap()
            .unwrap();
        assert_eq!(msg, RelayMessage::Ok("e1".into(), false, "blocked: spam".into()));

        let msg = RelayMessage::from_json(r#"["COUNT","abc",{"count":3}]"#)
            .unwrap()
            .unwrap();
        assert_eq!(msg, RelayMessage::Count("abc".into(), vec![json!({"count": 3})]));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(RelayMessage::from_json("{}").is_err());
        assert!(RelayMessage::from_json("[]").is_err());
        assert!(RelayMessage::from_json(r#"["EVENT"]"#).is_err());
        assert!(RelayMessage::from_json(r#"["OK","e1","yes",""]"#).is_err());
        assert_eq!(RelayMessage::from_json(r#"["HELLO"]"#).unwrap(), None);
    }

    #[test]
    fn test_generate_subscription_id() {
        let id1 = generate_subscription_id();
        let id2 = generate_subscription_id();
        assert_eq!(id1.len(), 32);
        assert_ne!(id1, id2);
    }

    fn shared() -> Mutex<Shared> {
        Mutex::new(Shared {
            state: ConnectionState::Connected,
            routes: Routes::default(),
        })
    }

    #[test]
    fn test_dispatch_routes_by_subscription() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = shared();
        shared
            .lock()
            .routes
            .subscriptions
            .insert("up1".into(), Listener::new(HandleId(1), tx.clone()));

        dispatch("wss://a", &shared, r#"["EVENT","up1",{"id":"e1"}]"#);
        dispatch("wss://a", &shared, r#"["EVENT","other",{"id":"e2"}]"#);
        dispatch("wss://a", &shared, r#"["EOSE","up1"]"#);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.kind, CallbackKind::Event(json!({"id": "e1"})));
        assert_eq!(rx.try_recv().unwrap().kind, CallbackKind::Eose);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_ok_consumes_publish_route() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = shared();
        shared
            .lock()
            .routes
            .publishes
            .insert("e1".into(), vec![Listener::new(HandleId(2), tx)]);

        dispatch("wss://a", &shared, r#"["OK","e1",true,""]"#);

        assert_eq!(
            rx.try_recv().unwrap().kind,
            CallbackKind::Ok {
                event_id: "e1".into(),
                accepted: true,
                message: String::new(),
            }
        );
        assert!(shared.lock().routes.publishes.is_empty());
    }

    #[test]
    fn test_dispatch_ok_answers_publishes_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = shared();
        shared.lock().routes.publishes.insert(
            "e1".into(),
            vec![
                Listener::new(HandleId(2), tx.clone()),
                Listener::new(HandleId(3), tx.clone()),
            ],
        );
        shared
            .lock()
            .routes
            .auth
            .insert(HandleId(1), Listener::new(HandleId(1), tx));

        dispatch("wss://a", &shared, r#"["OK","e1",true,""]"#);
        dispatch("wss://a", &shared, r#"["OK","e1",true,"duplicate:"]"#);

        assert_eq!(rx.try_recv().unwrap().handle, HandleId(2));
        assert_eq!(rx.try_recv().unwrap().handle, HandleId(3));
        assert!(rx.try_recv().is_err());
        assert!(shared.lock().routes.publishes.is_empty());
    }

    #[test]
    fn test_dispatch_auth_frames_reach_one_listener() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = shared();
        for handle in [HandleId(4), HandleId(1), HandleId(7)] {
            shared
                .lock()
                .routes
                .auth
                .insert(handle, Listener::new(handle, tx.clone()));
        }

        dispatch("wss://a", &shared, r#"["AUTH","c1"]"#);
        dispatch("wss://a", &shared, r#"["AUTH","c1"]"#);
        dispatch("wss://a", &shared, r#"["OK","auth-event",true,""]"#);

        let callbacks: Vec<Callback> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(callbacks.len(), 3);
        assert!(callbacks.iter().all(|cb| cb.handle == HandleId(1)));
        assert_eq!(callbacks[1].kind, CallbackKind::Auth("c1".into()));
        assert!(matches!(callbacks[2].kind, CallbackKind::Ok { accepted: true, .. }));
    }

    #[test]
    fn test_fail_notifies_pending_routes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = shared();
        {
            let mut guard = shared.lock();
            guard
                .routes
                .subscriptions
                .insert("up1".into(), Listener::new(HandleId(1), tx.clone()));
            guard
                .routes
                .publishes
                .insert("e1".into(), vec![Listener::new(HandleId(2), tx)]);
        }

        fail("wss://a", &shared, "Connection refused");

        let mut kinds = vec![rx.try_recv().unwrap(), rx.try_recv().unwrap()];
        kinds.sort_by_key(|cb| cb.handle);
        assert_eq!(
            kinds[0].kind,
            CallbackKind::Closed("error: Connection refused".into())
        );
        assert_eq!(
            kinds[1].kind,
            CallbackKind::Error(vec![json!("e1"), json!("error: Connection refused")])
        );
        assert_eq!(shared.lock().state, ConnectionState::Closed);

        // A second failure report is ignored
        fail("wss://a", &shared, "Connection refused");
        assert!(rx.try_recv().is_err());
    }
}
