//! Coordination core for a chatroom shared by a human and a team of AI
//! agent roles.
//!
//! Work enters as a task, is classified by the entry-point role, and is
//! handed from role to role until it reaches the user. Agents keep a
//! heartbeat lease; lapsed leases are noticed on read and can be restarted
//! through the machine-control daemon.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod handoff;
pub mod liveness;
pub mod log;
pub mod queue;
pub mod readiness;
pub mod restart;
pub mod role;
pub mod session;
pub mod store;
pub mod tasks;
pub mod util;

pub use coordinator::{Coordinator, CoordinatorEvent};
pub use error::{Error, Result};
