use std::path::Path;

use reck_common::{
    anyhow::{Context, Result},
    error::{self, CheckpointError},
    image::ImageWriter,
    io::remote_read,
    maps::{get_maps, MemoryRegion},
    nix::unistd::Pid,
    proto::BlockKind,
    ptracer::Ptracer,
    regs::instruction_pointer,
    tracing::{debug, info, trace},
};

/// Stops every task of `pid` and writes its registers and memory to `path`.
///
/// The tasks are released once the file is complete. A failed dump leaves
/// whatever was written so far at `path`.
pub fn dump_serialized_file(pid: Pid, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    info!("dumping {pid} to {}", path.display());

    let mut tracer = Ptracer::new(pid);
    tracer.init().with_context(|| format!("failed to attach to {pid}"))?;
    debug!("attached to {} tasks", tracer.tasks().len());

    let regs = tracer.get_regs()?;
    let fpregs = tracer.get_fpregs()?;
    if let Some(primary) = regs.first() {
        debug!("primary task stopped at {:#x}", instruction_pointer(primary));
    }
    let regions = get_maps(pid)?;

    let mut image = ImageWriter::create(path)?;
    for set in regs.iter() {
        image.write_registers(BlockKind::Regs, set)?;
    }
    for set in fpregs.iter() {
        image.write_registers(BlockKind::FpRegs, set)?;
    }

    let mut buf = vec![];
    let mut skipped = 0;
    for region in regions.iter() {
        if region.is_vdso() {
            trace!("recording placement of {region}");
            image.write_vdso(region)?;
            skipped += 1;
            continue;
        }
        if region.is_restricted() {
            trace!("skipping {region}");
            skipped += 1;
            continue;
        }

        let content = read_region(pid, region, &mut buf).with_context(|| format!("failed to read {region}"))?;
        image
            .write_region(region, content)
            .with_context(|| format!("failed to write {region}"))?;
    }
    image.finish()?;

    tracer.detach()?;
    info!(
        "dumped {} tasks and {} regions ({skipped} skipped)",
        regs.len(),
        regions.len() - skipped
    );

    Ok(())
}

/// Reads the whole of `region` out of `pid`. Regions without read permission
/// have no content; any other region must be read in full.
fn read_region<'a>(pid: Pid, region: &MemoryRegion, buf: &'a mut Vec<u8>) -> error::Result<&'a [u8]> {
    if !region.prot.read {
        return Ok(&[]);
    }

    buf.resize(region.size() as usize, 0);
    let read = remote_read(pid, region.start, buf).map_err(CheckpointError::trace("process_vm_readv", pid))?;
    if read != buf.len() {
        return Err(CheckpointError::ShortRead {
            expected: buf.len(),
            actual: read,
        });
    }

    trace!("read {region}");
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use reck_common::{libc, maps::parse_line};

    use super::*;

    fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    /// Maps two readable pages and unmaps the second, returning the first.
    fn half_mapped() -> (u64, usize) {
        let page = page_size();
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                2 * page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED);
        unsafe {
            (addr as *mut u8).write_bytes(0x5a, page);
            assert_eq!(libc::munmap((addr as *mut u8).add(page).cast(), page), 0);
        }
        (addr as u64, page)
    }

    fn region(start: u64, len: usize, perms: &str) -> MemoryRegion {
        parse_line(&format!("{start:x}-{:x} {perms} 00000000 00:00 0", start + len as u64))
    }

    #[test]
    fn test_reads_whole_region() {
        let (addr, page) = half_mapped();
        let mut buf = vec![];

        let content = read_region(Pid::this(), &region(addr, page, "rw-p"), &mut buf).unwrap();
        assert_eq!(content.len(), page);
        assert!(content.iter().all(|b| *b == 0x5a));

        unsafe { libc::munmap(addr as *mut libc::c_void, page) };
    }

    #[test]
    fn test_unreadable_region_has_no_content() {
        let mut buf = vec![];
        let content = read_region(Pid::this(), &region(0x1000, 0x1000, "---p"), &mut buf).unwrap();
        assert!(content.is_empty());
    }

    #[test]
    fn test_partial_read_is_an_error() {
        let (addr, page) = half_mapped();
        let mut buf = vec![];

        // the second page is gone, as if the file behind it had been truncated
        let res = read_region(Pid::this(), &region(addr, 2 * page, "r--p"), &mut buf);
        assert!(
            matches!(res, Err(CheckpointError::ShortRead { expected, actual }) if expected == 2 * page && actual == page),
            "{res:?}"
        );

        unsafe { libc::munmap(addr as *mut libc::c_void, page) };
    }

    #[test]
    fn test_failed_read_is_an_error() {
        let (addr, page) = half_mapped();
        unsafe { libc::munmap(addr as *mut libc::c_void, page) };

        let mut buf = vec![];
        let res = read_region(Pid::this(), &region(addr, page, "r--p"), &mut buf);
        assert!(matches!(res, Err(CheckpointError::Trace { .. })), "{res:?}");
    }
}
