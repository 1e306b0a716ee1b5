//! Runtime and image build types.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{BuildHandle, CoreError};

/// Base image used when a build is dispatched without one.
pub const DEFAULT_BASE_IMAGE: &str = "python:3.6-jessie";

/// The closed set of execution backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local child process.
    #[default]
    Local,
    /// In-process handler function.
    Handler,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Handler => "handler",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Special run modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunMode {
    #[default]
    #[serde(rename = "")]
    Default,
    /// Run the image as is, no build step.
    #[serde(rename = "pass")]
    Pass,
    /// Pass parameters as `--name value` arguments.
    #[serde(rename = "args")]
    Args,
    /// Like `args`, without any run context.
    #[serde(rename = "noctx")]
    NoCtx,
}

impl RunMode {
    /// Whether parameters are appended to the command line.
    pub fn params_as_args(&self) -> bool {
        matches!(self, Self::Args | Self::NoCtx)
    }
}

/// How a task's command is executed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSpec {
    pub kind: BackendKind,

    /// Runtime image; empty until given or built.
    pub image: String,

    pub mode: RunMode,

    pub build: BuildDescriptor,
}

impl RuntimeSpec {
    /// Create a new RuntimeSpec for the given backend kind.
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Builder method to set the runtime image.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Builder method to set the run mode.
    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder method to set the build descriptor.
    pub fn with_build(mut self, build: BuildDescriptor) -> Self {
        self.build = build;
        self
    }
}

/// Prerequisite image build state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildDescriptor {
    /// Target image of the build.
    pub image: String,

    pub base_image: String,

    /// Commands run on top of the base image.
    pub commands: Vec<String>,

    /// Source location to package into the image.
    pub source: String,

    /// Base64 encoded inline code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_code: Option<String>,

    /// Registry credentials secret name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Handle of an in-flight build.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_pod: Option<BuildHandle>,

    #[serde(skip)]
    is_built: bool,
}

impl BuildDescriptor {
    /// Create a build targeting the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    /// Builder method to set the base image.
    pub fn with_base_image(mut self, base_image: impl Into<String>) -> Self {
        self.base_image = base_image.into();
        self
    }

    /// Builder method to add build commands.
    pub fn with_commands(mut self, commands: Vec<String>) -> Self {
        self.commands.extend(commands);
        self
    }

    /// Builder method to set the source to package.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Builder method to embed code in the build.
    pub fn with_inline_code(mut self, body: &str) -> Self {
        self.inline_code = Some(STANDARD.encode(body.as_bytes()));
        self
    }

    /// Decode the inline code, if any.
    pub fn decoded_inline_code(&self) -> Result<Option<String>, CoreError> {
        let Some(encoded) = &self.inline_code else {
            return Ok(None);
        };
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| CoreError::InvalidInput(format!("inline code is not base64: {e}")))?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| CoreError::InvalidInput(format!("inline code is not UTF-8: {e}")))
    }

    /// Whether there is code that has to be packaged into an image.
    pub fn needs_packaging(&self) -> bool {
        !self.source.is_empty() || self.inline_code.is_some()
    }

    /// Whether a usable image exists for this descriptor.
    pub fn is_built(&self) -> bool {
        self.is_built
    }

    /// Mark the image as built. There is no way back.
    pub fn mark_built(&mut self) {
        self.is_built = true;
    }

    /// Render the image recipe for this build.
    pub fn dockerfile(&self) -> String {
        let base = if self.base_image.is_empty() {
            DEFAULT_BASE_IMAGE
        } else {
            self.base_image.as_str()
        };
        let mut dock = format!("FROM {base}\nWORKDIR /run\n");
        if !self.source.is_empty() {
            dock.push_str(&format!("ADD {} /run\n", self.source));
        }
        for command in &self.commands {
            dock.push_str(&format!("RUN {command}\n"));
        }
        dock.push_str("ENV PYTHONPATH /run");
        dock
    }
}
