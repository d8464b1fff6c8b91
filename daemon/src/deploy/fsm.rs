//! Finite State Machine for the deployment pipeline

use serde::{Deserialize, Serialize};

use crate::deploy::context::TOTAL_STEPS;

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Nothing has run yet
    Init,

    /// Cloning or updating the working tree
    SourceSync,

    /// Writing the environment file
    EnvInject,

    /// Installing dependencies and building
    Build,

    /// Locating and publishing build output
    ArtifactResolve,

    /// Replacing the backend process (backend sites only)
    ProcessStart,

    /// Installing the virtual host
    ProxyConfigure,

    /// Obtaining a TLS certificate
    CertProvision,

    /// Deployed
    Done,

    /// A step failed
    Failed,

    /// Cancellation was observed
    Canceled,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Failed | PipelineState::Canceled
        )
    }

    /// Progress units finished by the time this state is entered
    fn units_before(&self) -> u8 {
        match self {
            PipelineState::Init | PipelineState::SourceSync => 0,
            PipelineState::EnvInject => 1,
            PipelineState::Build => 2,
            PipelineState::ArtifactResolve => 3,
            PipelineState::ProcessStart => 4,
            // ProcessStart counts as done whether it ran or was skipped
            PipelineState::ProxyConfigure => 5,
            PipelineState::CertProvision => 6,
            PipelineState::Done | PipelineState::Failed => TOTAL_STEPS,
            PipelineState::Canceled => 0,
        }
    }
}

/// Pipeline event
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    SyncSource,
    InjectEnv,
    Build,
    ResolveArtifact,
    StartProcess,
    ConfigureProxy,
    ProvisionCertificate,
    Complete,
    Fail(String),
    Cancel,
}

/// Pipeline FSM. Transitions are strictly linear; `Failed` and `Canceled`
/// are reachable from every non-terminal state.
#[derive(Debug, Clone)]
pub struct PipelineFsm {
    state: PipelineState,
    backend: bool,
    completed: u8,
    error: Option<String>,
}

impl PipelineFsm {
    /// Create a new FSM in init state
    pub fn new(backend: bool) -> Self {
        Self {
            state: PipelineState::Init,
            backend,
            completed: 0,
            error: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Progress units completed so far
    pub fn completed(&self) -> u8 {
        self.completed
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: PipelineEvent) -> Result<(), String> {
        let new_state = match (self.state, &event) {
            (PipelineState::Init, PipelineEvent::SyncSource) => PipelineState::SourceSync,
            (PipelineState::SourceSync, PipelineEvent::InjectEnv) => PipelineState::EnvInject,
            (PipelineState::EnvInject, PipelineEvent::Build) => PipelineState::Build,
            (PipelineState::Build, PipelineEvent::ResolveArtifact) => PipelineState::ArtifactResolve,

            // Backends start a process, static sites skip straight to the proxy
            (PipelineState::ArtifactResolve, PipelineEvent::StartProcess) if self.backend => {
                PipelineState::ProcessStart
            }
            (PipelineState::ArtifactResolve, PipelineEvent::ConfigureProxy) if !self.backend => {
                PipelineState::ProxyConfigure
            }
            (PipelineState::ProcessStart, PipelineEvent::ConfigureProxy) => PipelineState::ProxyConfigure,

            (PipelineState::ProxyConfigure, PipelineEvent::ProvisionCertificate) => {
                PipelineState::CertProvision
            }
            (PipelineState::CertProvision, PipelineEvent::Complete) => PipelineState::Done,

            (state, PipelineEvent::Fail(err)) if !state.is_terminal() => {
                self.error = Some(err.clone());
                PipelineState::Failed
            }
            (state, PipelineEvent::Cancel) if !state.is_terminal() => PipelineState::Canceled,

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        if new_state != PipelineState::Canceled {
            self.completed = new_state.units_before();
        }
        self.state = new_state;
        Ok(())
    }
}
