//! Memory region model and the `/proc/<pid>/maps` parser.

use std::{fmt, fs};

use nix::{sys::mman::ProtFlags, unistd::Pid};
use serde::Serialize;

use crate::{
    error::{CheckpointError, Result},
    tracing::{trace, warn},
};

/// Capacity of the pathname buffer in a serialized region record.
pub const PATHNAME_CAPACITY: usize = libc::PATH_MAX as usize;

// kernel-provided mappings that cannot be recreated at their addresses
const RESTRICTED: &[&str] = &["[vdso]", "[vvar]", "[vvar_vclock]", "[vsyscall]"];

// the subset that can be moved, and that code inside the process points into
const VDSO: &[&str] = &["[vdso]", "[vvar]", "[vvar_vclock]"];

/// Access permissions of a region
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Protection {
    pub fn bits(&self) -> i32 {
        let mut bits = libc::PROT_NONE;
        if self.read {
            bits |= libc::PROT_READ;
        }
        if self.write {
            bits |= libc::PROT_WRITE;
        }
        if self.execute {
            bits |= libc::PROT_EXEC;
        }
        bits
    }

    pub fn from_bits(bits: i32) -> Self {
        Self {
            read: bits & libc::PROT_READ != 0,
            write: bits & libc::PROT_WRITE != 0,
            execute: bits & libc::PROT_EXEC != 0,
        }
    }

    pub fn flags(&self) -> ProtFlags {
        ProtFlags::from_bits_truncate(self.bits())
    }
}

/// Whether writes to a region are private (copy-on-write) or shared
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum Sharing {
    Private,
    Shared,
}

impl Sharing {
    pub fn bits(sharing: Option<Sharing>) -> i32 {
        match sharing {
            Some(Sharing::Private) => libc::MAP_PRIVATE,
            Some(Sharing::Shared) => libc::MAP_SHARED,
            None => 0,
        }
    }

    pub fn from_bits(bits: i32) -> Option<Sharing> {
        if bits & libc::MAP_PRIVATE != 0 {
            Some(Sharing::Private)
        } else if bits & libc::MAP_SHARED != 0 {
            Some(Sharing::Shared)
        } else {
            None
        }
    }
}

/// One contiguous virtual-memory mapping of a process.
///
/// A region with every field zeroed is what a failed parse leaves behind and
/// never appears in a parsed map.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub prot: Protection,
    pub sharing: Option<Sharing>,
    pub offset: u64,
    /// (major, minor)
    pub device: (u32, u32),
    pub inode: u64,
    pub pathname: String,
}

impl MemoryRegion {
    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_valid(&self) -> bool {
        self.end > self.start
    }

    pub fn is_stack(&self) -> bool {
        self.pathname.starts_with("[stack")
    }

    /// vdso, vvar and friends: skipped by dumps.
    pub fn is_restricted(&self) -> bool {
        RESTRICTED.iter().any(|name| self.pathname.contains(name))
    }

    /// The vdso and the vvar pages it reads. Dumps record where these were so
    /// a restore can move its own copies there.
    pub fn is_vdso(&self) -> bool {
        VDSO.contains(&self.pathname.as_str())
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{:x}-{:x} {}{}{}{} {:08x} {:02x}:{:02x} {}",
            self.start,
            self.end,
            flag(self.prot.read, 'r'),
            flag(self.prot.write, 'w'),
            flag(self.prot.execute, 'x'),
            match self.sharing {
                Some(Sharing::Private) => 'p',
                Some(Sharing::Shared) => 's',
                None => '-',
            },
            self.offset,
            self.device.0,
            self.device.1,
            self.inode,
        )?;
        if !self.pathname.is_empty() {
            write!(f, " {}", self.pathname)?;
        }
        Ok(())
    }
}

/// Parses an unsigned integer, failing unless all of `text` is consumed.
pub fn parse_ulong(text: &str, radix: u32) -> Option<u64> {
    if text.is_empty() || !text.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u64::from_str_radix(text, radix).ok()
}

/// Reads the current mapping table of `pid`, in kernel order.
pub fn get_maps(pid: Pid) -> Result<Vec<MemoryRegion>> {
    let path = format!("/proc/{pid}/maps");
    let content = fs::read_to_string(&path).map_err(CheckpointError::io(format!("reading {path}")))?;

    Ok(parse_maps(&content))
}

/// Parses every line of a maps listing; lines that fail to parse are dropped.
pub fn parse_maps(content: &str) -> Vec<MemoryRegion> {
    content
        .lines()
        .filter(|line| !line.is_empty())
        .map(parse_line)
        .filter(|region| {
            trace!("{region}");
            region.is_valid()
        })
        .collect()
}

/// Parses a single maps line. Never fails: a malformed line logs a warning
/// and yields whatever was parsed before the bad field (nothing, if the
/// address range itself is bad).
pub fn parse_line(line: &str) -> MemoryRegion {
    let mut region = MemoryRegion::default();
    if let Err(reason) = parse_fields(line, &mut region) {
        warn!("{reason}: {line:?}");
    }
    region
}

fn parse_fields(line: &str, region: &mut MemoryRegion) -> std::result::Result<(), &'static str> {
    let mut rest = line;

    let address = next_field(&mut rest).ok_or("missing space after address")?;
    let (start, end) = address
        .split_once('-')
        .ok_or("hyphen not found in address")?;
    let start = parse_ulong(start, 16).ok_or("bad start address")?;
    let end = parse_ulong(end, 16).ok_or("bad end address")?;
    region.start = start;
    region.end = end;

    let perms = next_field(&mut rest)
        .ok_or("missing space after permissions")?
        .as_bytes();
    if perms.len() < 4 {
        return Err("bad permissions");
    }
    region.prot = Protection {
        read: perms[0] == b'r',
        write: perms[1] == b'w',
        execute: perms[2] == b'x',
    };
    region.sharing = match perms[3] {
        b'p' => Some(Sharing::Private),
        b's' => Some(Sharing::Shared),
        _ => None,
    };

    let offset = next_field(&mut rest).ok_or("missing space after offset")?;
    region.offset = parse_ulong(offset, 16).ok_or("bad offset")?;

    let device = next_field(&mut rest).ok_or("missing space after device")?;
    let (major, minor) = device.split_once(':').unwrap_or((device, ""));
    region.device = (device_part(major, line), device_part(minor, line));

    // anonymous regions end right after the inode
    let inode = next_field(&mut rest).unwrap_or_else(|| std::mem::take(&mut rest));
    region.inode = parse_ulong(inode, 10).ok_or("bad inode")?;

    region.pathname = truncate_pathname(rest.trim_start_matches(' ')).to_string();

    Ok(())
}

fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let (field, tail) = rest.split_once(' ')?;
    *rest = tail;
    Some(field)
}

fn device_part(text: &str, line: &str) -> u32 {
    match parse_ulong(text, 16).and_then(|v| u32::try_from(v).ok()) {
        Some(v) => v,
        None => {
            warn!("bad device number {text:?}: {line:?}");
            0
        }
    }
}

fn truncate_pathname(pathname: &str) -> &str {
    // leave room for the terminating NUL of the serialized buffer
    let mut len = pathname.len().min(PATHNAME_CAPACITY - 1);
    while !pathname.is_char_boundary(len) {
        len -= 1;
    }
    &pathname[..len]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
55d0c2a1e000-55d0c2a20000 r--p 00000000 fd:01 1312341                    /usr/bin/cat
55d0c2a20000-55d0c2a25000 r-xp 00002000 fd:01 1312341                    /usr/bin/cat
55d0c3d6b000-55d0c3d8c000 rw-p 00000000 00:00 0                          [heap]
7f2b9c400000-7f2b9c600000 rw-p 00000000 00:00 0
7f2b9c7a0000-7f2b9c7a2000 rw-s 00000000 00:05 1026                       /SYSV00000000 (deleted)
7ffd0e6b5000-7ffd0e6d6000 rw-p 00000000 00:00 0                          [stack]
7ffd0e7d2000-7ffd0e7d6000 r--p 00000000 00:00 0                          [vvar]
7ffd0e7d6000-7ffd0e7d8000 r-xp 00000000 00:00 0                          [vdso]
ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0                  [vsyscall]
";

    #[test]
    fn test_parse_line() {
        let region = parse_line("7f0000000000-7f0000001000 rw-p 00000000 08:01 1234 /lib/test.so");

        assert_eq!(region.start, 0x7f0000000000);
        assert_eq!(region.end, 0x7f0000001000);
        assert_eq!(
            region.prot,
            Protection {
                read: true,
                write: true,
                execute: false
            }
        );
        assert_eq!(region.prot.bits(), libc::PROT_READ | libc::PROT_WRITE);
        assert_eq!(region.sharing, Some(Sharing::Private));
        assert_eq!(region.offset, 0);
        assert_eq!(region.device, (8, 1));
        assert_eq!(region.inode, 1234);
        assert_eq!(region.pathname, "/lib/test.so");
        assert_eq!(region.size(), 0x1000);
    }

    #[test]
    fn test_parse_line_without_hyphen_is_zeroed() {
        let region = parse_line("7f00000000007f0000001000 rw-p 00000000 08:01 1234 /lib/test.so");

        assert_eq!(region, MemoryRegion::default());
        assert!(!region.is_valid());
    }

    #[test]
    fn test_parse_line_bad_end_address_is_zeroed() {
        let region = parse_line("7f0000000000-7f00zz001000 rw-p 00000000 08:01 1234 /lib/test.so");

        assert_eq!(region, MemoryRegion::default());
    }

    #[test]
    fn test_parse_maps_skips_malformed_lines() {
        let content = "\
7f0000000000-7f0000001000 r-xp 00000000 08:01 1234 /lib/a.so
garbage
7f0000001000-7f0000003000 rw-p 00001000 08:01 1234 /lib/a.so
";
        let regions = parse_maps(content);

        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].start, 0x7f0000000000);
        assert_eq!(regions[1].start, 0x7f0000001000);
        assert_eq!(regions[1].offset, 0x1000);
    }

    #[test]
    fn test_parse_sample() {
        let regions = parse_maps(SAMPLE);
        assert_eq!(regions.len(), 9);

        let anon = &regions[3];
        assert_eq!(anon.inode, 0);
        assert_eq!(anon.pathname, "");
        assert_eq!(anon.size(), 0x200000);

        let shm = &regions[4];
        assert_eq!(shm.sharing, Some(Sharing::Shared));
        assert_eq!(shm.device, (0, 5));
        assert_eq!(shm.pathname, "/SYSV00000000 (deleted)");

        assert!(regions[5].is_stack());
        assert!(!regions[2].is_stack());

        let restricted = regions
            .iter()
            .filter(|r| r.is_restricted())
            .map(|r| r.pathname.as_str())
            .collect::<Vec<_>>();
        assert_eq!(restricted, ["[vvar]", "[vdso]", "[vsyscall]"]);

        let movable = regions
            .iter()
            .filter(|r| r.is_vdso())
            .map(|r| r.pathname.as_str())
            .collect::<Vec<_>>();
        assert_eq!(movable, ["[vvar]", "[vdso]"]);

        let vsyscall = regions.last().unwrap();
        assert!(!vsyscall.prot.read);
        assert!(vsyscall.prot.execute);
    }

    #[test]
    fn test_display_matches_maps_format() {
        for line in SAMPLE.lines() {
            let region = parse_line(line);
            let reparsed = parse_line(&region.to_string());
            assert_eq!(reparsed, region);
        }

        let region = parse_line("7f0000000000-7f0000001000 rw-p 00000000 08:01 1234 /lib/test.so");
        assert_eq!(
            region.to_string(),
            "7f0000000000-7f0000001000 rw-p 00000000 08:01 1234 /lib/test.so"
        );
    }

    #[test]
    fn test_wide_device_numbers() {
        let region = parse_line("1000-2000 r--p 00000000 103:0a 77 /data/file");
        assert_eq!(region.device, (0x103, 0xa));
        assert_eq!(region.inode, 77);
    }

    #[test]
    fn test_long_pathname_is_truncated() {
        let long = "é".repeat(PATHNAME_CAPACITY);
        let region = parse_line(&format!("1000-2000 r--p 00000000 08:01 1 /{long}"));

        assert!(region.pathname.len() < PATHNAME_CAPACITY);
        assert!(region.pathname.starts_with("/é"));
    }

    #[test]
    fn test_parse_ulong() {
        assert_eq!(parse_ulong("1234", 10), Some(1234));
        assert_eq!(parse_ulong("7f00", 16), Some(0x7f00));
        assert_eq!(parse_ulong("", 10), None);
        assert_eq!(parse_ulong("+1", 10), None);
        assert_eq!(parse_ulong("12z", 16), None);
        assert_eq!(parse_ulong("ff", 10), None);
        assert_eq!(parse_ulong("18446744073709551616", 10), None);
    }

    #[test]
    fn test_get_maps_of_self() {
        let regions = get_maps(Pid::this()).unwrap();

        assert!(!regions.is_empty());
        assert!(regions.windows(2).all(|w| w[0].start < w[1].start));
        assert!(regions.iter().any(|r| r.is_stack()));
    }

    #[test]
    fn test_overlaps() {
        let region = parse_line("1000-2000 r--p 00000000 08:01 1 /x");
        assert!(region.overlaps(0x1fff, 0x3000));
        assert!(region.overlaps(0x0, 0x1001));
        assert!(!region.overlaps(0x2000, 0x3000));
        assert!(!region.overlaps(0x0, 0x1000));
    }
}
