//! Retry-until-complete transfers over byte streams and foreign address spaces.
//!
//! Every helper keeps going after a partial transfer. An error on the very
//! first attempt is returned as is; an error after some bytes were moved ends
//! the transfer and the count moved so far is returned instead.

use std::io::{self, ErrorKind, IoSlice, IoSliceMut, Read, Write};

use nix::{
    sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec},
    unistd::Pid,
};

/// Calls `step` with the number of bytes already moved until `len` bytes are
/// done, a step moves nothing, or a step fails.
pub fn transfer<E>(len: usize, mut step: impl FnMut(usize) -> Result<usize, E>) -> Result<usize, E> {
    let mut done = 0;
    while done < len {
        match step(done) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if done == 0 => return Err(e),
            Err(_) => break,
        }
    }
    Ok(done)
}

pub fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let len = buf.len();
    transfer(len, |done| loop {
        match reader.read(&mut buf[done..]) {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            res => return res,
        }
    })
}

pub fn write_full(writer: &mut impl Write, buf: &[u8]) -> io::Result<usize> {
    transfer(buf.len(), |done| loop {
        match writer.write(&buf[done..]) {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            res => return res,
        }
    })
}

/// Copies `buf.len()` bytes starting at `remote_addr` in `pid` into `buf`.
pub fn remote_read(pid: Pid, remote_addr: u64, buf: &mut [u8]) -> nix::Result<usize> {
    let len = buf.len();
    transfer(len, |done| {
        let remote = [RemoteIoVec {
            base: remote_addr as usize + done,
            len: len - done,
        }];
        process_vm_readv(pid, &mut [IoSliceMut::new(&mut buf[done..])], &remote)
    })
}

/// Copies `buf` to `remote_addr` in `pid`.
pub fn remote_write(pid: Pid, remote_addr: u64, buf: &[u8]) -> nix::Result<usize> {
    let len = buf.len();
    transfer(len, |done| {
        let remote = [RemoteIoVec {
            base: remote_addr as usize + done,
            len: len - done,
        }];
        process_vm_writev(pid, &[IoSlice::new(&buf[done..])], &remote)
    })
}
