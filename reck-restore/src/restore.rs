use std::{convert::Infallible, path::Path, slice};

use reck_common::{
    anyhow::{bail, Context, Result},
    helper::{self, Permit},
    image::ImageReader,
    maps::get_maps,
    nix::unistd::Pid,
    proto::{BlockEntry, BlockKind},
    ptracer::Ptracer,
    regs::{FpRegs, Regs},
    tracing::{debug, info, silenced, trace, warn},
};

use crate::{
    mmap::{check_collision, map_exact, protect},
    vdso,
};

/// Rebuilds the checkpointed memory of `path` inside the calling process and
/// then jumps into the checkpointed execution.
///
/// Only the primary task is resumed, so the caller must be single-threaded.
/// On success this never returns: the calling frame is replaced by the
/// checkpointed one. A failure after the first region was mapped leaves the
/// address space half restored.
///
/// Our vdso is moved to where the checkpointed process kept its own just
/// before the registers are injected. Logging is off from then on.
pub fn restore_serialized_file(path: impl AsRef<Path>) -> Result<Infallible> {
    let path = path.as_ref();
    info!("restoring {}", path.display());

    let mut image = ImageReader::open(path)?;
    let index = image.index()?;

    let mut regs = vec![];
    let mut fpregs = vec![];
    let mut vdso = vec![];
    for entry in index.iter() {
        match entry.kind {
            BlockKind::Regs => regs.push(image.read_registers::<Regs>(entry)?),
            BlockKind::FpRegs => fpregs.push(image.read_registers::<FpRegs>(entry)?),
            BlockKind::MemoryMap => restore_region(&mut image, entry)?,
            BlockKind::VdsoMap => vdso.push(image.read_region(entry)?.0),
        }
    }
    drop(image);

    if regs.len() > 1 {
        warn!("only the primary task is resumed, {} other task snapshots are ignored", regs.len() - 1);
    }
    let (Some(regs), Some(fpregs)) = (regs.first().copied(), fpregs.first().copied()) else {
        bail!("{} holds no register snapshots", path.display());
    };

    let moves = vdso::plan(&get_maps(Pid::this())?, &vdso).context("cannot place the vdso")?;
    info!("memory restored, moving {} vdso regions and injecting registers", moves.len());

    silenced(|| {
        let relocation = vdso::relocate(moves)?;
        let e = match inject(regs, fpregs) {
            Ok(never) => match never {},
            Err(e) => e,
        };
        relocation.undo().context("failed to move the vdso back")?;
        Err(e)
    })
}

fn restore_region(image: &mut ImageReader, entry: &BlockEntry) -> Result<()> {
    let (region, len) = image.read_region(entry)?;

    check_collision(&region)?;
    map_exact(&region)?;

    // freshly mapped read-write and exactly region.size() long
    let content = unsafe { slice::from_raw_parts_mut(region.start as *mut u8, len) };
    image
        .read_content(content)
        .with_context(|| format!("filling {region}"))?;

    protect(&region)?;
    trace!("restored {region}");

    Ok(())
}

/// Has a helper overwrite our registers from outside, since a task cannot
/// rewrite its own. Returns only if the helper failed.
fn inject(regs: Regs, fpregs: FpRegs) -> Result<Infallible> {
    let child = helper::spawn(Permit::Any, move |parent| {
        let mut tracer = Ptracer::new(parent);
        tracer.init()?;

        // general registers last, they move the instruction pointer
        tracer.set_fpregs(&[fpregs])?;
        tracer.set_regs(&[regs])?;

        tracer.abandon();
        Ok(())
    })?;

    debug!("waiting for injector {child}");
    let status = helper::wait(child).context("waiting for injector")?;
    bail!("register injection by {child} failed: {status:?}")
}
