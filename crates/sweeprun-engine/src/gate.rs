//! Build gate: decides whether a runnable image exists before execution.
//!
//! The gate is a small state machine driven by the caller:
//!
//! ```text
//! Unresolved --(image given / pass mode)--> Ready
//! Unresolved --(dispatch)--> Pending --(succeeded)--> Ready
//!                               |
//!                               +--(failed/error)--> Failed
//! ```
//!
//! Each [`BuildGate::step`] does at most one builder call. Waiting for a
//! build means calling `step` again later; the gate never sleeps.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use sweeprun_core::{BuildDescriptor, BuildHandle, BuildStatus, RunMode, RuntimeSpec};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::EngineError;

/// Errors raised by image builders.
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("Build dispatch failed: {0}")]
    Dispatch(String),

    #[error("Build status unavailable: {0}")]
    Status(String),
}

/// External image builder.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Start a build and return its handle.
    async fn dispatch(&self, build: &BuildDescriptor) -> Result<BuildHandle, BuilderError>;

    /// Check the status of a dispatched build.
    async fn poll_status(&self, handle: &BuildHandle) -> Result<BuildStatus, BuilderError>;
}

/// Builder replaying a fixed status script, one status per poll.
///
/// Once the script runs out the last status repeats.
#[derive(Debug, Default)]
pub struct ScriptedBuilder {
    script: Mutex<VecDeque<BuildStatus>>,
    last: Mutex<Option<BuildStatus>>,
    dispatched: Mutex<Vec<BuildDescriptor>>,
    polls: Mutex<u32>,
}

impl ScriptedBuilder {
    /// Create a builder that reports the given statuses in order.
    pub fn new(script: Vec<BuildStatus>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Builds dispatched so far.
    pub fn dispatched(&self) -> Vec<BuildDescriptor> {
        self.dispatched
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Number of status polls so far.
    pub fn poll_count(&self) -> u32 {
        self.polls.lock().map(|p| *p).unwrap_or_default()
    }
}

#[async_trait]
impl Builder for ScriptedBuilder {
    async fn dispatch(&self, build: &BuildDescriptor) -> Result<BuildHandle, BuilderError> {
        let mut dispatched = self
            .dispatched
            .lock()
            .map_err(|_| BuilderError::Dispatch("builder state poisoned".to_string()))?;
        debug!(image = %build.image, dockerfile = %build.dockerfile(), "Scripted build dispatched");
        dispatched.push(build.clone());
        Ok(BuildHandle::new(format!("build-{}", dispatched.len())))
    }

    async fn poll_status(&self, _handle: &BuildHandle) -> Result<BuildStatus, BuilderError> {
        let poisoned = || BuilderError::Status("builder state poisoned".to_string());
        *self.polls.lock().map_err(|_| poisoned())? += 1;
        let next = self.script.lock().map_err(|_| poisoned())?.pop_front();
        let mut last = self.last.lock().map_err(|_| poisoned())?;
        if let Some(status) = next {
            *last = Some(status);
        }
        Ok(last.unwrap_or(BuildStatus::Pending))
    }
}

/// State of the build gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    /// Not yet evaluated.
    Unresolved,
    /// A build was dispatched and is being polled.
    Pending(BuildHandle),
    /// A runnable image exists.
    Ready,
    /// The build failed. Absorbing.
    Failed {
        handle: BuildHandle,
        status: BuildStatus,
    },
}

/// Outcome of one gate step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Not ready yet; carries the last builder status.
    NotReady(BuildStatus),
}

/// Gate on image readiness for one runtime.
#[derive(Debug, Clone)]
pub struct BuildGate {
    state: GateState,
}

impl Default for BuildGate {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildGate {
    /// Create a gate in the unresolved state.
    pub fn new() -> Self {
        Self {
            state: GateState::Unresolved,
        }
    }

    /// Create a gate resuming from a runtime's build descriptor.
    pub fn for_runtime(runtime: &RuntimeSpec) -> Self {
        let state = if runtime.build.is_built() {
            GateState::Ready
        } else if let Some(handle) = &runtime.build.build_pod {
            GateState::Pending(handle.clone())
        } else {
            GateState::Unresolved
        };
        Self { state }
    }

    /// Current state.
    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == GateState::Ready
    }

    /// Advance the gate by one step.
    pub async fn step(
        &mut self,
        runtime: &mut RuntimeSpec,
        builder: Option<&dyn Builder>,
    ) -> Result<Readiness, EngineError> {
        match self.state.clone() {
            GateState::Ready => Ok(Readiness::Ready),
            GateState::Failed { handle, status } => Err(EngineError::Build { handle, status }),
            GateState::Pending(handle) => self.poll(runtime, builder, handle).await,
            GateState::Unresolved => self.resolve(runtime, builder).await,
        }
    }

    async fn resolve(
        &mut self,
        runtime: &mut RuntimeSpec,
        builder: Option<&dyn Builder>,
    ) -> Result<Readiness, EngineError> {
        if runtime.build.is_built() {
            self.state = GateState::Ready;
            return Ok(Readiness::Ready);
        }

        let build = &runtime.build;
        if build.commands.is_empty() && !build.needs_packaging() && runtime.image.is_empty() {
            if build.base_image.is_empty() {
                return Err(EngineError::Configuration(
                    "image or base_image must be specified".to_string(),
                ));
            }
            if runtime.mode == RunMode::Pass {
                runtime.image = build.base_image.clone();
            }
        }

        if !runtime.image.is_empty() {
            info!(image = %runtime.image, "Build not required");
            runtime.build.mark_built();
            self.state = GateState::Ready;
            return Ok(Readiness::Ready);
        }

        let builder = builder.ok_or_else(|| {
            EngineError::Configuration("image build required but no builder configured".to_string())
        })?;
        if runtime.build.image.is_empty() {
            return Err(EngineError::Configuration(
                "build spec must have a target image".to_string(),
            ));
        }

        let handle = builder.dispatch(&runtime.build).await?;
        info!(handle = %handle, image = %runtime.build.image, "Image build dispatched");
        runtime.build.build_pod = Some(handle.clone());
        self.state = GateState::Pending(handle);
        Ok(Readiness::NotReady(BuildStatus::Pending))
    }

    async fn poll(
        &mut self,
        runtime: &mut RuntimeSpec,
        builder: Option<&dyn Builder>,
        handle: BuildHandle,
    ) -> Result<Readiness, EngineError> {
        let builder = builder.ok_or_else(|| {
            EngineError::Configuration("build in progress but no builder configured".to_string())
        })?;
        let status = builder.poll_status(&handle).await?;

        match status {
            BuildStatus::Succeeded => {
                info!(handle = %handle, "Build completed successfully");
                runtime.build.build_pod = None;
                runtime.build.mark_built();
                if runtime.image.is_empty() {
                    runtime.image = runtime.build.image.clone();
                }
                self.state = GateState::Ready;
                Ok(Readiness::Ready)
            }
            s if s.is_failure() => {
                self.state = GateState::Failed {
                    handle: handle.clone(),
                    status: s,
                };
                Err(EngineError::Build { handle, status: s })
            }
            s => {
                info!(handle = %handle, status = %s, "Builder status is {}, wait for it to complete", s);
                Ok(Readiness::NotReady(s))
            }
        }
    }
}
