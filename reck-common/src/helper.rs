//! Disposable helper processes that attach back to the process forking them.

use std::os::fd::RawFd;

use nix::{
    errno::Errno,
    sys::wait::{waitpid, WaitStatus},
    unistd::{close, fork, pipe, read, write, ForkResult, Pid},
};

use crate::{
    error::{CheckpointError, Result},
    ptracer::{allow_pid, Tracer},
    tracing::{self, debug, error},
};

/// Which tracer the forking process allows before the helper starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Only the forked helper
    Helper,
    Any,
}

/// Forks a helper that runs `body` with the pid of its parent, then exits.
///
/// The helper does not start `body` until the parent has allowed it to
/// attach. Errors from `body` are logged by the helper and turn into a
/// non-zero exit status; they never unwind into the parent's code. The helper
/// logs through a console of its own, so a log line half written by another
/// thread of the parent at the fork does not block it.
pub fn spawn<F>(permit: Permit, body: F) -> Result<Pid>
where
    F: FnOnce(Pid) -> anyhow::Result<()>,
{
    let parent = Pid::this();
    let (ready_rx, ready_tx) = pipe().map_err(CheckpointError::trace("pipe", parent))?;

    match unsafe { fork() }.map_err(CheckpointError::trace("fork", parent))? {
        ForkResult::Child => {
            let _log = tracing::after_fork();
            let _ = close(ready_tx);
            let code = match await_ready(ready_rx) {
                Ok(()) => match body(parent) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("helper failed: {e:?}");
                        1
                    }
                },
                Err(e) => {
                    debug!("parent {parent} gave up before the helper started: {e}");
                    1
                }
            };
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            let _ = close(ready_rx);

            let tracer = match permit {
                Permit::Helper => Tracer::Pid(child),
                Permit::Any => Tracer::Any,
            };
            if let Err(e) = allow_pid(tracer).and_then(|()| signal_ready(ready_tx, child)) {
                let _ = close(ready_tx);
                let _ = wait(child);
                return Err(e);
            }
            let _ = close(ready_tx);

            debug!("spawned helper {child}");
            Ok(child)
        }
    }
}

/// Waits for `child` to terminate.
pub fn wait(child: Pid) -> nix::Result<WaitStatus> {
    loop {
        match waitpid(child, None) {
            Err(Errno::EINTR) => continue,
            res => return res,
        }
    }
}

fn signal_ready(fd: RawFd, child: Pid) -> Result<()> {
    loop {
        match write(fd, &[1]) {
            Ok(1) => return Ok(()),
            Ok(_) => return Err(CheckpointError::trace("write", child)(Errno::EPIPE)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(CheckpointError::trace("write", child)(e)),
        }
    }
}

fn await_ready(fd: RawFd) -> nix::Result<()> {
    let mut buf = [0u8; 1];
    let res = loop {
        match read(fd, &mut buf) {
            Ok(1) => break Ok(()),
            Ok(_) => break Err(Errno::EPIPE),
            Err(Errno::EINTR) => continue,
            Err(e) => break Err(e),
        }
    };
    let _ = close(fd);
    res
}
