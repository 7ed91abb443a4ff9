//! VEIL full node orchestrator.
//!
//! The node is a single event reactor that owns every piece of mutable
//! state: peer sessions, the fetch-task registry, the transaction pools
//! (fluff, stem, dependent), the bulletin-board replicator, the sync
//! controller, and the miner coordinator. All state transitions happen in
//! [`node::Node::handle_event`] with an injected clock; sockets, timers and
//! CPU-heavy verification live outside and talk to the reactor through
//! typed events.

pub mod bbs;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod miner;
pub mod node;
pub mod peer;
pub mod processor;
pub mod shutdown;
pub mod sync;
pub mod tasks;
pub mod testing;
pub mod txpool;
pub mod wanted;
pub mod workers;

pub use config::NodeConfig;
pub use error::NodeError;
pub use events::{NodeAction, NodeCallbacks, NodeEvent, SyncError, TimerKind};
pub use node::Node;
pub use processor::{DataStatus, FastSyncWindow, Processor, ProcessorEvent, TxStatus};
pub use sync::{SyncProgress, SyncState};
