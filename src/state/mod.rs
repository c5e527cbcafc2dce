//! The in-memory network model: entities, indexes, and identifiers.

pub mod channel;
pub mod ident;
pub mod kline;
pub mod server;
pub mod uid;
pub mod user;
pub mod world;

pub use channel::Channel;
pub use kline::KLine;
pub use server::Server;
pub use uid::{Sid, Uid, UidGenerator};
pub use user::User;
pub use world::World;
