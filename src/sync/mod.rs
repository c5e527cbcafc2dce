//! Network-state synchronization: the link burst, netsplit cleanup, and
//! nick-collision arbitration.

pub mod burst;
pub mod collision;
pub mod split;
