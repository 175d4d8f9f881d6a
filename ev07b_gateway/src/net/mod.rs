pub mod connection;
pub mod tcp;

pub use connection::{ConnId, ConnectionHandle};
pub use tcp::{ConnectionOptions, bind, serve};
