//! Error taxonomy for a harness run.
//!
//! Nothing here is recovered or retried: every variant ends the run and maps
//! to its own process exit code.

use std::io;
use std::process::ExitCode;

use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

/// Exit status for failures inside the harness itself.
pub const EXIT_INTERNAL: u8 = 7;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// The checklist file is missing or malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The clean-and-build collaborator exited non-zero or could not run.
    #[error("build failed: {0}")]
    Build(String),

    /// A unit-test module failed; later modules were not run.
    #[error("unit test {module} error")]
    UnitTest { module: String },

    /// The emulator collaborator could not be spawned.
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },

    /// A checklist case did not produce one of its fragments.
    #[error("{case}: missing fragment {fragment:?}")]
    Verification { case: String, fragment: String },

    /// The lab-test session never printed its required fragment.
    #[error("lab test: missing fragment {fragment:?}")]
    LabTest { fragment: String },

    /// Harness-side I/O while driving a session.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl HarnessError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        HarnessError::Io {
            context: context.into(),
            source,
        }
    }

    /// Process exit status reported for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            HarnessError::UnitTest { .. } => 1,
            HarnessError::Build(_) => 2,
            HarnessError::Verification { .. } => 3,
            HarnessError::LabTest { .. } => 4,
            HarnessError::Launch { .. } => 5,
            HarnessError::Config(_) => 6,
            HarnessError::Io { .. } => EXIT_INTERNAL,
        }
    }
}

impl From<&HarnessError> for ExitCode {
    fn from(err: &HarnessError) -> Self {
        ExitCode::from(err.exit_code())
    }
}
