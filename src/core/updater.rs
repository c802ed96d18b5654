/// Host package and release upgrades
/// Both run unattended and keep locally modified configuration files

use std::process::Stdio;
use tracing::{info, warn};

use crate::core::error::{AgentError, Result};

pub const PACKAGE_UPGRADE: &str = "apt -y update && DEBIAN_FRONTEND=noninteractive \
    DEBIAN_PRIORITY=critical UCF_FORCE_CONFFOLD=1 apt -qq -y \
    -o Dpkg::Options::=--force-confdef -o Dpkg::Options::=--force-confold upgrade";

pub const RELEASE_UPGRADE: &str =
    "apt -y update && do-release-upgrade -f DistUpgradeViewNonInteractive";

/// Run `script` through the host shell and wait for it
pub async fn run_shell(name: &str, script: &str) -> Result<()> {
    info!(task = name, "running host command");

    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AgentError::io(format!("spawning {}", name), e))?;

    if output.status.success() {
        info!(task = name, "host command finished");
        return Ok(());
    }

    let code = output.status.code().map(i64::from).unwrap_or(-1);
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    warn!(task = name, code, "host command failed");
    Err(AgentError::CommandFailed {
        container: "host".to_string(),
        program: name.to_string(),
        code,
        stderr,
    })
}

pub async fn upgrade_packages() -> Result<()> {
    run_shell("apt upgrade", PACKAGE_UPGRADE).await
}

pub async fn upgrade_distribution() -> Result<()> {
    run_shell("do-release-upgrade", RELEASE_UPGRADE).await
}
