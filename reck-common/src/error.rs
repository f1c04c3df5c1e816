use std::io;

use nix::{errno::Errno, unistd::Pid};
use thiserror::Error;

use crate::proto::BlockKind;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{op} failed for task {pid}: {source}")]
    Trace {
        op: &'static str,
        pid: Pid,
        #[source]
        source: Errno,
    },

    #[error("task {pid} did not report a stop: {status}")]
    NotStopped { pid: Pid, status: String },

    #[error("no tasks found for process {pid}")]
    NoTasks { pid: Pid },

    #[error("process {pid} is not attached")]
    NotAttached { pid: Pid },

    #[error("tracer for process {pid} was already used")]
    Reused { pid: Pid },

    #[error("{snapshots} register snapshots given for {tasks} attached tasks")]
    CountMismatch { tasks: usize, snapshots: usize },

    #[error("bad magic {found:02x?}, expected {expected:02x?}")]
    BadMagic { found: [u8; 4], expected: [u8; 4] },

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("{kind} block holds {actual} bytes, expected {expected}")]
    SizeMismatch {
        kind: BlockKind,
        expected: u64,
        actual: u64,
    },

    #[error("block entry at {position} points at payload offset {offset}")]
    OffsetMismatch { position: u64, offset: u64 },

    #[error("{kind} block at offset {offset} claims {size} bytes, more than any file holds")]
    Overflow { kind: BlockKind, offset: u64, size: u64 },

    #[error("reading process information: {0}")]
    Proc(#[from] procfs::ProcError),

    #[error("malformed block: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("failed to encode block: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("mapping {len:#x} bytes at {addr:#x} failed: {source}")]
    Mapping {
        addr: u64,
        len: u64,
        #[source]
        source: Errno,
    },

    #[error("mapping requested at {requested:#x} landed at {actual:#x}")]
    Relocated { requested: u64, actual: u64 },

    #[error("region {region} overlaps existing mapping {existing}")]
    Collision { region: String, existing: String },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

impl CheckpointError {
    pub fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }

    pub fn trace(op: &'static str, pid: Pid) -> impl FnOnce(Errno) -> Self {
        move |source| Self::Trace { op, pid, source }
    }
}
