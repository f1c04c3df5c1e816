use std::path::Path;

use reck_common::{
    anyhow::{bail, Context, Result},
    helper::{self, Permit},
    nix::{errno::Errno, sys::wait::WaitStatus},
    tracing::{debug, info},
};

mod dump;

pub use dump::dump_serialized_file;

/// How a [`make_checkpoint`] call came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The checkpoint was written and this process carried on.
    Dumped,
    /// This process was resumed from the checkpoint.
    Restored,
}

/// Checkpoints the calling process to `path`.
///
/// Must be called from the main thread. A helper is forked to do the dump and
/// this call blocks until it exits; the helper logs through a console of its
/// own, so other threads logging at the time of the fork cannot stall it.
/// A process later resumed from the file returns from this same call with
/// [`Outcome::Restored`], with its vdso back at the address it had here.
pub fn make_checkpoint(path: impl AsRef<Path>) -> Result<Outcome> {
    let path = path.as_ref().to_path_buf();
    info!("checkpointing to {}", path.display());

    let child = helper::spawn(Permit::Helper, move |parent| dump_serialized_file(parent, &path))?;
    debug!("waiting for dump helper {child}");

    // a resumed process restarts this wait in a process that never forked the helper
    match helper::wait(child) {
        Ok(WaitStatus::Exited(_, 0)) => Ok(Outcome::Dumped),
        Ok(status) => bail!("dump helper {child} failed: {status:?}"),
        Err(Errno::ECHILD) => {
            info!("resumed from checkpoint");
            Ok(Outcome::Restored)
        }
        Err(e) => Err(e).context("failed to wait for dump helper"),
    }
}
