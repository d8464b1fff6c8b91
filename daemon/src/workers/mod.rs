pub mod deployer;
pub mod spool;
