//! Agora node wiring.
//!
//! Builds the ledger, settlement client, payment manager, and orchestrator
//! around an overlay handle, and runs the message dispatcher that routes
//! inbound payment traffic.

mod config;
mod dispatch;
mod logging;
mod node;

pub use config::{LogArgs, NodeConfig};
pub use dispatch::Dispatcher;
pub use logging::init_logging;
pub use node::{AgoraNode, ResponderFn};
