//! EV07B/EV04 tracker gateway: TCP sessions, command handlers, server-side
//! geofencing and the offline command queue.
pub mod admin;
pub mod commands;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod geofence;
pub mod health;
pub mod logging;
pub mod net;
pub mod session;
pub mod store;

pub use errors::{GatewayError, Result};
pub use gateway::Gateway;
