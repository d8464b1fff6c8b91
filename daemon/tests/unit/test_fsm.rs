//! FSM unit tests

use dropletd::deploy::fsm::{PipelineEvent, PipelineFsm, PipelineState};
use dropletd::deploy::TOTAL_STEPS;

#[test]
fn test_fsm_initial_state() {
    let fsm = PipelineFsm::new(false);
    assert_eq!(fsm.state(), PipelineState::Init);
    assert!(fsm.error().is_none());
    assert_eq!(fsm.completed(), 0);
}

#[test]
fn test_fsm_backend_success_flow() {
    let mut fsm = PipelineFsm::new(true);

    let steps = [
        (PipelineEvent::SyncSource, PipelineState::SourceSync, 0),
        (PipelineEvent::InjectEnv, PipelineState::EnvInject, 1),
        (PipelineEvent::Build, PipelineState::Build, 2),
        (PipelineEvent::ResolveArtifact, PipelineState::ArtifactResolve, 3),
        (PipelineEvent::StartProcess, PipelineState::ProcessStart, 4),
        (PipelineEvent::ConfigureProxy, PipelineState::ProxyConfigure, 5),
        (PipelineEvent::ProvisionCertificate, PipelineState::CertProvision, 6),
        (PipelineEvent::Complete, PipelineState::Done, TOTAL_STEPS),
    ];
    for (event, state, completed) in steps {
        fsm.process(event).unwrap();
        assert_eq!(fsm.state(), state);
        assert_eq!(fsm.completed(), completed);
    }
    assert!(fsm.state().is_terminal());
}

#[test]
fn test_fsm_static_skips_process_start() {
    let mut fsm = PipelineFsm::new(false);

    fsm.process(PipelineEvent::SyncSource).unwrap();
    fsm.process(PipelineEvent::InjectEnv).unwrap();
    fsm.process(PipelineEvent::Build).unwrap();
    fsm.process(PipelineEvent::ResolveArtifact).unwrap();
    fsm.process(PipelineEvent::ConfigureProxy).unwrap();

    // The skipped step still counts as done
    assert_eq!(fsm.completed(), 5);
}

#[test]
fn test_fsm_failure_flow() {
    let mut fsm = PipelineFsm::new(true);

    fsm.process(PipelineEvent::SyncSource).unwrap();
    fsm.process(PipelineEvent::InjectEnv).unwrap();
    fsm.process(PipelineEvent::Build).unwrap();
    fsm.process(PipelineEvent::Fail("npm run build exited with 1".to_string()))
        .unwrap();

    assert_eq!(fsm.state(), PipelineState::Failed);
    assert_eq!(fsm.error(), Some("npm run build exited with 1"));
    assert_eq!(fsm.completed(), TOTAL_STEPS);
}

#[test]
fn test_fsm_terminal_states_are_final() {
    let mut fsm = PipelineFsm::new(false);
    fsm.process(PipelineEvent::SyncSource).unwrap();
    fsm.process(PipelineEvent::Cancel).unwrap();

    assert_eq!(fsm.state(), PipelineState::Canceled);
    assert!(fsm.process(PipelineEvent::InjectEnv).is_err());
    assert!(fsm.process(PipelineEvent::Complete).is_err());
    assert_eq!(fsm.state(), PipelineState::Canceled);
}
