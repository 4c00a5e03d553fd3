//! Tillsync: realtime state synchronization core for POS terminals.
//!
//! Registers, kitchen displays, and customer-facing devices each hold
//! [`SyncedState`] containers keyed by logical state name. A container reads
//! and writes like a local state cell; underneath, every write lands in the
//! local SQLite store and is broadcast over MQTT so all terminals converge.
//! Replication is last-writer-wins and eventually consistent; no central
//! server arbitrates.
//!
//! The transport connection is process-wide: every key multiplexes over one
//! [`PubSubClient`], so a single `disconnect()`/`connect()` cycle affects
//! every active key at once.

pub mod bus;
pub mod config;
pub mod db;
pub mod model;
pub mod protocol;
pub mod storage;
pub mod sync;
pub mod telemetry;
pub mod transport;

pub use config::ConnectOptions;
pub use db::StateStore;
pub use protocol::{topic_for_key, ConnectionStatus, Envelope, TOPIC_PREFIX};
pub use sync::SyncedState;
pub use transport::PubSubClient;
