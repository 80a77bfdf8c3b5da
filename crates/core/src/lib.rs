//! Shared types for the carrier bus: the message envelope, queue
//! addressing, and configuration.
//!
//! This crate is the leaf of the workspace. It carries no runtime
//! dependencies so that transports and the bus can agree on wire types
//! without pulling each other in.

pub mod config;
pub mod message;

pub use config::{BusConfig, CoordinatorConfig};
pub use message::{AddrError, Message, QueueAddr};
