//! Per-task register snapshots, read and written through `PTRACE_GETREGSET`.

use std::{
    ffi::c_void,
    mem::{size_of, MaybeUninit},
    slice,
};

use nix::{errno::Errno, unistd::Pid};

pub type Regs = libc::user_regs_struct;

#[cfg(target_arch = "x86_64")]
pub type FpRegs = libc::user_fpregs_struct;
#[cfg(target_arch = "aarch64")]
pub type FpRegs = libc::user_fpsimd_struct;

/// A fixed-size, architecture-defined register set.
pub trait RegisterSet: Copy {
    /// ELF note type selecting the set
    const NOTE: usize;
    const GET_OP: &'static str;
    const SET_OP: &'static str;
}

impl RegisterSet for Regs {
    const NOTE: usize = libc::NT_PRSTATUS as usize;
    const GET_OP: &'static str = "PTRACE_GETREGSET(NT_PRSTATUS)";
    const SET_OP: &'static str = "PTRACE_SETREGSET(NT_PRSTATUS)";
}

impl RegisterSet for FpRegs {
    const NOTE: usize = libc::NT_PRFPREG as usize;
    const GET_OP: &'static str = "PTRACE_GETREGSET(NT_PRFPREG)";
    const SET_OP: &'static str = "PTRACE_SETREGSET(NT_PRFPREG)";
}

/// Captures a register set of a stopped, traced task.
pub fn get<T: RegisterSet>(tid: Pid) -> nix::Result<T> {
    let mut set = MaybeUninit::<T>::zeroed();
    let mut io = libc::iovec {
        iov_base: set.as_mut_ptr() as *mut c_void,
        iov_len: size_of::<T>(),
    };

    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            tid.as_raw(),
            T::NOTE as *mut c_void,
            &mut io as *mut libc::iovec,
        )
    };
    if res < 0 {
        return Err(Errno::last());
    }
    if io.iov_len != size_of::<T>() {
        return Err(Errno::EIO);
    }

    Ok(unsafe { set.assume_init() })
}

/// Overwrites a register set of a stopped, traced task.
pub fn set<T: RegisterSet>(tid: Pid, set: &T) -> nix::Result<()> {
    let mut io = libc::iovec {
        iov_base: set as *const T as *mut c_void,
        iov_len: size_of::<T>(),
    };

    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            tid.as_raw(),
            T::NOTE as *mut c_void,
            &mut io as *mut libc::iovec,
        )
    };
    if res < 0 {
        return Err(Errno::last());
    }

    Ok(())
}

pub fn as_bytes<T: RegisterSet>(set: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(set as *const T as *const u8, size_of::<T>()) }
}

pub fn from_bytes<T: RegisterSet>(buf: &[u8]) -> Option<T> {
    (buf.len() == size_of::<T>()).then(|| unsafe { buf.as_ptr().cast::<T>().read_unaligned() })
}

pub fn zeroed<T: RegisterSet>() -> T {
    unsafe { MaybeUninit::<T>::zeroed().assume_init() }
}

#[cfg(target_arch = "x86_64")]
pub fn instruction_pointer(regs: &Regs) -> u64 {
    regs.rip
}

#[cfg(target_arch = "aarch64")]
pub fn instruction_pointer(regs: &Regs) -> u64 {
    regs.pc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_snapshot_sizes() {
        assert_eq!(size_of::<Regs>(), 27 * 8);
        assert_eq!(size_of::<FpRegs>(), 512);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_bytes_view() {
        let mut regs = zeroed::<Regs>();
        regs.rip = 0x4010_2030;
        regs.rsp = 0x7ffd_0000_1000;

        let bytes = as_bytes(&regs).to_vec();
        assert_eq!(bytes.len(), size_of::<Regs>());

        let back = from_bytes::<Regs>(&bytes).unwrap();
        assert_eq!(instruction_pointer(&back), 0x4010_2030);
        assert_eq!(back.rsp, 0x7ffd_0000_1000);

        assert!(from_bytes::<Regs>(&bytes[1..]).is_none());
        assert!(from_bytes::<FpRegs>(&bytes).is_none());
    }

    #[test]
    fn test_get_without_tracing_fails() {
        // we are not tracing ourselves
        assert!(get::<Regs>(Pid::this()).is_err());
    }
}
