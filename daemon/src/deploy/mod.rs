//! Deployment pipeline

pub mod artifact;
pub mod build;
pub mod certs;
pub mod context;
pub mod env;
pub mod fsm;
pub mod pipeline;
pub mod ports;
pub mod proxy;
pub mod runner;
pub mod source;
pub mod supervisor;

pub use context::{DeploymentObserver, ExecutionContext, NoopObserver, TOTAL_STEPS};
pub use pipeline::Pipeline;
