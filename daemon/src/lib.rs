//! dropletd Library
//!
//! Core modules for the push-to-deploy daemon.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod storage;
pub mod utils;
pub mod workers;
