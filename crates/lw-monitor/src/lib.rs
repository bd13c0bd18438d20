//! LeakWatch Session Monitor
//!
//! The stateful engine behind LeakWatch. Per monitored tab it ingests network
//! request and CSP violation events, counts resources that escape the replay
//! boundary, enriches them with rules from an external policy service, and
//! mirrors its state to a key-value store.
//!
//! # Modules
//!
//! - `store`: Session State Store, the sole owner of per-session collections
//! - `pipeline`: Event loop, session state machine and the query handle
//! - `gateway`: Policy service client
//! - `persist`: Key-value stores and the ordered durability mirror
//! - `summary`: Badge/summary projection
//! - `capture`: Console capture service
//! - `config`: Monitor configuration
//! - `model`: Per-session data model
//! - `error`: Error taxonomy

pub mod capture;
pub mod config;
pub mod error;
pub mod gateway;
pub mod model;
pub mod persist;
pub mod pipeline;
pub mod store;
pub mod summary;

// Re-export commonly used types
pub use capture::{ConsoleCapture, LogEntry, LogLevel, SessionObserver};
pub use config::MonitorConfig;
pub use error::MonitorError;
pub use gateway::{HttpPolicyGateway, PolicyGateway};
pub use model::{
    CspViolation, MonitorState, ObservedResource, Policy, RewriteAttempt, RewriteOutcome, Session, Summary,
};
pub use persist::{JsonFileKv, KvStore, MemoryKv, Mirror};
pub use pipeline::{Monitor, MonitorEvent, MonitorHandle};
pub use store::SessionStore;
pub use summary::summarize;
