//! Task controller: holds every task of a process stopped under ptrace.

use std::fs;

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};

use crate::{
    error::{CheckpointError, Result},
    maps::parse_ulong,
    regs::{self, FpRegs, RegisterSet, Regs},
    tracing::{debug, warn},
};

/// Who may attach to the calling process, see [`allow_pid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracer {
    Any,
    Pid(Pid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unattached,
    Attached,
    Detached,
}

/// Single-use controller for one attach/detach cycle of a process.
///
/// Tasks are kept in enumeration order with the primary task first. Every
/// register operation uses this order. Dropping an attached controller
/// detaches it.
#[derive(Debug)]
pub struct Ptracer {
    pid: Pid,
    tasks: Vec<Pid>,
    state: State,
}

impl Ptracer {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            tasks: vec![],
            state: State::Unattached,
        }
    }

    pub fn tasks(&self) -> &[Pid] {
        &self.tasks
    }

    /// Attaches to every task of the process.
    ///
    /// Tasks are listed again after each round of attaching, until a listing
    /// brings up nothing new. A thread created while we were attaching is
    /// therefore still caught.
    pub fn init(&mut self) -> Result<()> {
        self.init_with(list_tasks)
    }

    fn init_with(&mut self, mut list: impl FnMut(Pid) -> Result<Vec<Pid>>) -> Result<()> {
        if self.state != State::Unattached {
            return Err(CheckpointError::Reused { pid: self.pid });
        }

        loop {
            let fresh = list(self.pid)?
                .into_iter()
                .filter(|tid| !self.tasks.contains(tid))
                .collect::<Vec<_>>();
            if fresh.is_empty() {
                break;
            }

            for tid in fresh {
                ptrace::attach(tid).map_err(CheckpointError::trace("PTRACE_ATTACH", tid))?;
                self.tasks.push(tid);
                self.state = State::Attached;

                wait_for_stop(tid)?;
                debug!("attached to task {tid} of {}", self.pid);
            }
        }

        Ok(())
    }

    pub fn get_regs(&self) -> Result<Vec<Regs>> {
        self.get_all()
    }

    pub fn get_fpregs(&self) -> Result<Vec<FpRegs>> {
        self.get_all()
    }

    pub fn set_regs(&self, snapshots: &[Regs]) -> Result<()> {
        self.set_all(snapshots)
    }

    pub fn set_fpregs(&self, snapshots: &[FpRegs]) -> Result<()> {
        self.set_all(snapshots)
    }

    /// Releases every attached task, the primary task last.
    ///
    /// Secondary tasks that already exited are skipped.
    pub fn detach(&mut self) -> Result<()> {
        self.ensure_attached()?;
        self.state = State::Detached;

        for tid in self.tasks.iter().filter(|tid| **tid != self.pid) {
            match ptrace::detach(*tid, None) {
                Ok(()) => debug!("detached from task {tid}"),
                Err(Errno::ESRCH) => debug!("task {tid} is gone"),
                Err(e) => warn!("detaching from task {tid}: {e}"),
            }
        }

        if self.tasks.contains(&self.pid) {
            ptrace::detach(self.pid, None).map_err(CheckpointError::trace("PTRACE_DETACH", self.pid))?;
            debug!("detached from {}", self.pid);
        }

        Ok(())
    }

    /// Gives up the controller without detaching. The tasks stay traced until
    /// this process exits.
    pub fn abandon(mut self) {
        self.state = State::Detached;
    }

    fn ensure_attached(&self) -> Result<()> {
        match self.state {
            State::Attached => Ok(()),
            _ => Err(CheckpointError::NotAttached { pid: self.pid }),
        }
    }

    fn get_all<T: RegisterSet>(&self) -> Result<Vec<T>> {
        self.ensure_attached()?;

        self.tasks
            .iter()
            .map(|tid| regs::get::<T>(*tid).map_err(CheckpointError::trace(T::GET_OP, *tid)))
            .collect()
    }

    fn set_all<T: RegisterSet>(&self, snapshots: &[T]) -> Result<()> {
        self.ensure_attached()?;
        if snapshots.len() != self.tasks.len() {
            return Err(CheckpointError::CountMismatch {
                tasks: self.tasks.len(),
                snapshots: snapshots.len(),
            });
        }

        for (tid, set) in self.tasks.iter().zip(snapshots) {
            regs::set(*tid, set).map_err(CheckpointError::trace(T::SET_OP, *tid))?;
        }

        Ok(())
    }
}

impl Drop for Ptracer {
    fn drop(&mut self) {
        if self.state == State::Attached {
            if let Err(e) = self.detach() {
                warn!("{e}");
            }
        }
    }
}

fn wait_for_stop(tid: Pid) -> Result<()> {
    loop {
        match waitpid(tid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(..)) => return Ok(()),
            Ok(status) => {
                return Err(CheckpointError::NotStopped {
                    pid: tid,
                    status: format!("{status:?}"),
                })
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(CheckpointError::trace("waitpid", tid)(e)),
        }
    }
}

/// Lists the tasks of `pid`, primary task first.
pub fn list_tasks(pid: Pid) -> Result<Vec<Pid>> {
    let path = format!("/proc/{pid}/task");
    let entries = fs::read_dir(&path).map_err(|e| match e.raw_os_error() {
        Some(libc::ENOENT) => CheckpointError::NoTasks { pid },
        _ => CheckpointError::io(format!("listing {path}"))(e),
    })?;

    let mut tasks = vec![];
    for entry in entries {
        let entry = entry.map_err(CheckpointError::io(format!("listing {path}")))?;
        let tid = entry
            .file_name()
            .to_str()
            .and_then(|name| parse_ulong(name, 10))
            .and_then(|tid| i32::try_from(tid).ok());

        match tid {
            Some(tid) if tid == pid.as_raw() => tasks.insert(0, Pid::from_raw(tid)),
            Some(tid) => tasks.push(Pid::from_raw(tid)),
            None => warn!("ignoring task entry {:?} of {pid}", entry.file_name()),
        }
    }

    if tasks.is_empty() {
        return Err(CheckpointError::NoTasks { pid });
    }

    Ok(tasks)
}

/// Lets `tracer` attach to the calling process even though it is not our
/// parent. Without Yama there is nothing to allow and this succeeds.
pub fn allow_pid(tracer: Tracer) -> Result<()> {
    let arg = match tracer {
        Tracer::Any => libc::PR_SET_PTRACER_ANY as libc::c_ulong,
        Tracer::Pid(pid) => pid.as_raw() as libc::c_ulong,
    };

    let res = unsafe { libc::prctl(libc::PR_SET_PTRACER, arg) };
    if res < 0 {
        return match Errno::last() {
            Errno::EINVAL => {
                debug!("PR_SET_PTRACER unsupported, assuming no Yama");
                Ok(())
            }
            e => Err(CheckpointError::trace("PR_SET_PTRACER", Pid::this())(e)),
        };
    }

    debug!("allowed {tracer:?} to trace {}", Pid::this());
    Ok(())
}
