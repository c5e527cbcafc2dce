//! Command handlers, split by who is talking: unregistered connections,
//! local users, and linked peer servers.

pub mod client;
pub mod local;
pub mod s2s;
