//! Clean-and-build trigger

use tracing::info;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};

/// Run the clean-and-build collaborator to completion.
///
/// Every call is a full clean rebuild; the collaborator's own output is
/// passed straight through to the terminal.
pub fn clean_and_build(config: &HarnessConfig) -> Result<()> {
    info!("🔨 Building: {}", config.build);

    let status = config
        .build
        .command(&config.base_dir)
        .status()
        .map_err(|e| HarnessError::Build(format!("failed to execute `{}`: {}", config.build, e)))?;

    if !status.success() {
        return Err(HarnessError::Build(format!("`{}` exited with {}", config.build, status)));
    }

    info!("✅ Build finished");
    Ok(())
}
