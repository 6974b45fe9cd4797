//! vmmd: the supervisor daemon of the orchestrator.
//!
//! The engine is a pure transition function over the VM table; the
//! supervisor owns the sockets, helper channels, and hypervisor processes
//! and executes the engine's side-effect intents.

pub mod engine;
pub mod helper;
pub mod spawn;
pub mod supervisor;

pub use supervisor::{Supervisor, VmmConfig};
