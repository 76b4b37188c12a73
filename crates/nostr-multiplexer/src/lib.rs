//! Nostr multiplexing gateway.
//!
//! A client opens one websocket and addresses each request to a set of
//! upstream relays:
//!
//! ```text
//! [{"relays": ["wss://relay.damus.io", "wss://nos.lol"]}, ["REQ", "feed", {"kinds": [1]}]]
//! ```
//!
//! The gateway fans the request out, removes duplicate events per
//! subscription, and answers with every response tagged by the relay it came
//! from:
//!
//! ```text
//! [{"relays": ["wss://nos.lol"]}, ["EVENT", "feed", {...}]]
//! [{"relays": ["wss://nos.lol"]}, ["EOSE", "feed"]]
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_multiplexer::{GatewayConfig, GatewayServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = GatewayServer::new(GatewayConfig::default());
//!     if let Err(e) = server.start().await {
//!         eprintln!("gateway stopped: {}", e);
//!     }
//! }
//! ```

pub mod config;
pub mod envelope;
mod error;
pub mod executor;
pub mod pool;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod telemetry;

pub use config::{GatewayConfig, SessionConfig};
pub use envelope::{DecodeError, Envelope, Request, Verb};
pub use error::{MultiplexerError, Result, is_benign};
pub use executor::{Callback, CallbackKind, Cancel, Executor, FanoutTarget, HandleId, Listener};
pub use pool::{PoolExecutor, PoolTarget, RelayPool};
pub use registry::{SubscriptionHandle, SubscriptionRegistry};
pub use relay::{ConnectionState, RelayConnection, RelayMessage};
pub use server::GatewayServer;
pub use session::{Multiplexer, SessionEvent, SessionState};
