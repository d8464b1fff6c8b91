mod common;

mod test_fsm;
mod test_pipeline;
mod test_runner;
mod test_spool;
