//! Domain models

pub mod deployment;
pub mod site;
