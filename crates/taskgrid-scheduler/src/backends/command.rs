//! External provisioning commands.
//!
//! The fleet and batch backends hand capacity requests to an operator
//! supplied program and pass the request through environment variables.

use anyhow::{Context, anyhow, bail};
use tokio::process::Command;
use tracing::debug;

/// Run `argv` to completion with extra environment variables. A non-zero
/// exit is an error. The child is killed if the future is dropped.
pub async fn run_command(argv: &[String], env: &[(&str, &str)]) -> anyhow::Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;
    debug!(%program, ?args, "running command");
    let status = Command::new(program)
        .args(args)
        .envs(env.iter().copied())
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("failed to spawn {program}"))?;
    if !status.success() {
        bail!("{program} exited with {status}");
    }
    Ok(())
}
