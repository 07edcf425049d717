//! Orchestration core: durable server registry, reconciliation of registry
//! state against live container state, the per-server control supervisor,
//! and per-server event fan-out.

pub mod config;
pub mod events;
pub mod reconciler;
pub mod registry;
pub mod supervisor;

pub use config::Config;
pub use events::{EventHub, Subscription};
pub use reconciler::Reconciler;
pub use registry::{Account, AccountId, ServerId, ServerRecord, ServerRegistry};
pub use supervisor::{Command, ControlSupervisor};
