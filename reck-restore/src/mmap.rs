//! Recreating recorded regions at their exact addresses.

use std::ffi::c_void;

use reck_common::{
    error::{CheckpointError, Result},
    libc,
    maps::MemoryRegion,
    nix::{errno::Errno, sys::mman::mprotect},
    procfs::process::Process,
    tracing::trace,
};
use syscalls::Sysno;

// raw syscalls report failure as -errno
fn check(ret: usize) -> std::result::Result<usize, Errno> {
    if ret > -4096isize as usize {
        Err(Errno::from_i32(-(ret as isize) as i32))
    } else {
        Ok(ret)
    }
}

/// Maps an anonymous read-write region at `region.start`, or fails.
///
/// Stacks are mapped growable with the start address as a hint; everything
/// else is mapped fixed. A mapping that did not land at the recorded address
/// is undone and reported.
pub fn map_exact(region: &MemoryRegion) -> Result<()> {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    if region.is_stack() {
        flags |= libc::MAP_GROWSDOWN | libc::MAP_STACK;
    } else {
        flags |= libc::MAP_FIXED;
    }

    let ret = unsafe {
        syscalls::raw::syscall6(
            Sysno::mmap,
            region.start as usize,
            region.size() as usize,
            (libc::PROT_READ | libc::PROT_WRITE) as usize,
            flags as usize,
            -1isize as usize,
            0,
        )
    };
    let addr = check(ret).map_err(|source| CheckpointError::Mapping {
        addr: region.start,
        len: region.size(),
        source,
    })? as u64;

    if addr != region.start {
        unmap(addr, region.size())?;
        return Err(CheckpointError::Relocated {
            requested: region.start,
            actual: addr,
        });
    }

    trace!("mapped {:#x}-{:#x}", region.start, region.end);
    Ok(())
}

/// Applies the recorded protection of `region`.
pub fn protect(region: &MemoryRegion) -> Result<()> {
    unsafe {
        mprotect(
            region.start as *mut c_void,
            region.size() as usize,
            region.prot.flags(),
        )
    }
    .map_err(|source| CheckpointError::Mapping {
        addr: region.start,
        len: region.size(),
        source,
    })
}

/// Maps `len` bytes of inaccessible memory wherever the kernel likes.
pub fn reserve(len: u64) -> Result<u64> {
    let ret = unsafe {
        syscalls::raw::syscall6(
            Sysno::mmap,
            0,
            len as usize,
            libc::PROT_NONE as usize,
            (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as usize,
            -1isize as usize,
            0,
        )
    };
    check(ret)
        .map(|addr| addr as u64)
        .map_err(|source| CheckpointError::Mapping { addr: 0, len, source })
}

/// Moves the mapping at `from` to `to`, replacing anything mapped there.
pub fn remap(from: u64, len: u64, to: u64) -> Result<()> {
    let ret = unsafe {
        syscalls::raw::syscall5(
            Sysno::mremap,
            from as usize,
            len as usize,
            len as usize,
            (libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED) as usize,
            to as usize,
        )
    };
    let addr = check(ret).map_err(|source| CheckpointError::Mapping { addr: from, len, source })? as u64;
    if addr != to {
        return Err(CheckpointError::Relocated {
            requested: to,
            actual: addr,
        });
    }
    Ok(())
}

pub fn unmap(addr: u64, len: u64) -> Result<()> {
    let ret = unsafe { syscalls::raw::syscall2(Sysno::munmap, addr as usize, len as usize) };
    check(ret)
        .map(|_| ())
        .map_err(|source| CheckpointError::Mapping { addr, len, source })
}

/// Fails if `region` overlaps anything currently mapped in this process.
pub fn check_collision(region: &MemoryRegion) -> Result<()> {
    let maps = Process::myself()?.maps()?;

    for map in maps.into_iter() {
        let (start, end) = map.address;
        if region.overlaps(start, end) {
            return Err(CheckpointError::Collision {
                region: region.to_string(),
                existing: format!("{start:x}-{end:x} {:?}", map.pathname),
            });
        }
    }

    Ok(())
}
