//! Per-session upstream connection pool and the executor built on it.

use crate::envelope::Verb;
use crate::error::{MultiplexerError, Result};
use crate::executor::{Cancel, Executor, FanoutTarget, Listener};
use crate::relay::RelayConnection;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

struct PooledRelay {
    connection: Arc<RelayConnection>,
    retained: usize,
}

#[derive(Default)]
struct PoolInner {
    connections: HashMap<String, PooledRelay>,
}

/// Keyed cache of upstream connections, one per URL.
///
/// Owned by a single session. Every [`get`](Self::get) retains a handle that
/// must be given back with [`release`](Self::release); connections stay open
/// until [`clear`](Self::clear) regardless of the count.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<Mutex<PoolInner>>,
    connect_timeout: Duration,
}

impl RelayPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner::default())),
            connect_timeout,
        }
    }

    /// Get the connection for `url`, opening one if there is none or the
    /// previous one has died.
    pub fn get(&self, url: &str) -> Result<Arc<RelayConnection>> {
        validate_url(url)?;

        let mut inner = self.inner.lock();
        let retained = match inner.connections.get_mut(url) {
            Some(pooled) if !pooled.connection.is_closed() => {
                pooled.retained += 1;
                return Ok(Arc::clone(&pooled.connection));
            }
            Some(pooled) => pooled.retained,
            None => 0,
        };

        debug!("Opening relay connection {}", url);
        let connection = RelayConnection::connect(url, self.connect_timeout);
        inner.connections.insert(
            url.to_string(),
            PooledRelay {
                connection: Arc::clone(&connection),
                retained: retained + 1,
            },
        );
        Ok(connection)
    }

    /// Give back a handle obtained from [`get`](Self::get).
    pub fn release(&self, url: &str) {
        if let Some(pooled) = self.inner.lock().connections.get_mut(url) {
            pooled.retained = pooled.retained.saturating_sub(1);
        }
    }

    /// Handles currently retained for `url`
    pub fn retained(&self, url: &str) -> usize {
        self.inner
            .lock()
            .connections
            .get(url)
            .map_or(0, |pooled| pooled.retained)
    }

    pub fn total_retained(&self) -> usize {
        self.inner
            .lock()
            .connections
            .values()
            .map(|pooled| pooled.retained)
            .sum()
    }

    /// Number of pooled connections
    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every connection. Safe to call more than once.
    pub fn clear(&self) {
        let connections = std::mem::take(&mut self.inner.lock().connections);
        for (_, pooled) in connections {
            pooled.connection.close();
        }
    }
}

fn validate_url(url: &str) -> Result<()> {
    let parsed =
        Url::parse(url).map_err(|e| MultiplexerError::InvalidUrl(format!("{}: {}", url, e)))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(MultiplexerError::InvalidUrl(format!(
            "{}: unsupported scheme {}",
            url, other
        ))),
    }
}

/// Connections one request fans out over
pub struct PoolTarget {
    pool: RelayPool,
    connections: Vec<Arc<RelayConnection>>,
}

impl FanoutTarget for PoolTarget {
    fn relays(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|c| c.url().to_string())
            .collect()
    }

    fn release(self) {
        for connection in &self.connections {
            self.pool.release(connection.url());
        }
    }
}

/// [`Executor`] over a session's [`RelayPool`]
pub struct PoolExecutor {
    pool: RelayPool,
}

impl PoolExecutor {
    pub fn new(pool: RelayPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    fn open(
        target: &PoolTarget,
        filters: &[Value],
        listener: &Listener,
        open: fn(&RelayConnection, &[Value], Listener) -> String,
    ) -> Cancel {
        let opened: Vec<(Arc<RelayConnection>, String)> = target
            .connections
            .iter()
            .map(|c| (Arc::clone(c), open(c.as_ref(), filters, listener.clone())))
            .collect();

        Cancel::new(move || {
            for (connection, sub_id) in opened {
                connection.close_subscription(&sub_id);
            }
        })
    }
}

impl Executor for PoolExecutor {
    type Target = PoolTarget;

    fn resolve(&mut self, relays: &[String]) -> PoolTarget {
        let connections = relays
            .iter()
            .filter_map(|url| match self.pool.get(url) {
                Ok(connection) => Some(connection),
                Err(e) => {
                    debug!("Skipping relay: {}", e);
                    None
                }
            })
            .collect();

        PoolTarget {
            pool: self.pool.clone(),
            connections,
        }
    }

    fn subscribe(
        &mut self,
        target: &PoolTarget,
        filters: Vec<Value>,
        listener: Listener,
    ) -> Cancel {
        Self::open(target, &filters, &listener, RelayConnection::subscribe)
    }

    fn publish(
        &mut self,
        target: &PoolTarget,
        verb: Verb,
        event: Value,
        listener: Listener,
    ) -> Cancel {
        let handle = listener.handle();
        for connection in &target.connections {
            connection.publish(verb.as_str(), &event, listener.clone());
        }

        let Some(event_id) = event.get("id").and_then(Value::as_str).map(str::to_string) else {
            return Cancel::noop();
        };
        let connections = target.connections.clone();
        Cancel::new(move || {
            for connection in connections {
                connection.forget_publish(&event_id, handle);
            }
        })
    }

    fn count(&mut self, target: &PoolTarget, filters: Vec<Value>, listener: Listener) -> Cancel {
        Self::open(target, &filters, &listener, RelayConnection::count)
    }

    fn handle_auth(&mut self, target: &PoolTarget, listener: Listener) -> Cancel {
        let handle = listener.handle();
        for connection in &target.connections {
            connection.add_auth_listener(listener.clone());
        }

        let connections = target.connections.clone();
        Cancel::new(move || {
            for connection in connections {
                connection.remove_auth_listener(handle);
            }
        })
    }

    fn clear(&mut self) {
        self.pool.clear();
    }
}
