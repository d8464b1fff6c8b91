//! Wire models shared between dropletd and the deployment queue.

pub mod models;

pub use models::*;
