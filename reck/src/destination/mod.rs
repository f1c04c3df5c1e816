use std::{
    convert::Infallible,
    env,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::Command,
};

use reck_common::{
    anyhow::{anyhow, Context, Result},
    tracing::{debug, info},
};
use reck_restore::IMAGE_ENV;

const RESTORE_BIN: &str = "reck-restore";

/// Path of the restore binary installed next to the running executable.
pub fn restore_binary() -> Result<PathBuf> {
    let exe = env::current_exe().context("failed to locate current executable")?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", exe.display()))?;

    Ok(dir.join(RESTORE_BIN))
}

/// Replaces this process with the restore binary, so the checkpoint is
/// rebuilt in a fresh process image.
pub fn exec_restore(path: &Path) -> Result<Infallible> {
    let path = path
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", path.display()))?;
    let restore_bin = restore_binary()?;

    info!("restoring {}", path.display());
    debug!("executing {}", restore_bin.display());
    let err = Command::new(&restore_bin).env(IMAGE_ENV, &path).exec();

    Err(err).with_context(|| format!("failed to execute {}", restore_bin.display()))
}
