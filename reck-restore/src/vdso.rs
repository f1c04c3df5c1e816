//! Moving this process's vdso to where the checkpointed process had its own.
//!
//! Restored code calls into the vdso through pointers taken before the dump.
//! The pages belong to the kernel and are the same in every process, so
//! moving ours under those pointers is enough.

use reck_common::{
    anyhow::{bail, Result},
    maps::MemoryRegion,
};

use crate::mmap::{remap, reserve};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub from: u64,
    pub to: u64,
    pub len: u64,
}

impl Move {
    fn reversed(self) -> Self {
        Self {
            from: self.to,
            to: self.from,
            len: self.len,
        }
    }
}

/// Pairs every recorded vdso region with our region of the same name.
///
/// `current` is this process's memory map. Recorded regions must match ours
/// in size and must not land on anything but our own vdso regions, which are
/// moved out of the way first.
pub fn plan(current: &[MemoryRegion], recorded: &[MemoryRegion]) -> Result<Vec<Move>> {
    let mut moves = vec![];

    for target in recorded {
        let Some(own) = current.iter().find(|r| r.is_vdso() && r.pathname == target.pathname) else {
            bail!("checkpoint has {target} but this process has no {}", target.pathname);
        };
        if own.size() != target.size() {
            bail!("checkpoint has {target} but ours is {own}");
        }
        if let Some(existing) = current
            .iter()
            .find(|r| !r.is_vdso() && r.overlaps(target.start, target.end))
        {
            bail!("{target} would replace {existing}");
        }

        if own.start != target.start {
            moves.push(Move {
                from: own.start,
                to: target.start,
                len: own.size(),
            });
        }
    }

    Ok(moves)
}

/// Moves that have been carried out and can be taken back.
#[derive(Debug)]
pub struct Relocation {
    moves: Vec<Move>,
}

impl Relocation {
    /// Moves the regions back where they were.
    pub fn undo(self) -> Result<()> {
        let back = self.moves.iter().rev().map(|m| m.reversed()).collect::<Vec<_>>();
        shuffle(&back)
    }
}

/// Carries out `moves`. A failure part way leaves the vdso wherever it got.
///
/// The caller's libc keeps pointing at the old addresses, so nothing in
/// this process may read the clock until the moves are undone.
pub fn relocate(moves: Vec<Move>) -> Result<Relocation> {
    shuffle(&moves)?;
    Ok(Relocation { moves })
}

// Everything goes to one parked area first, so a destination may overlap
// any source.
fn shuffle(moves: &[Move]) -> Result<()> {
    let total = moves.iter().map(|m| m.len).sum::<u64>();
    if total == 0 {
        return Ok(());
    }

    let park = reserve(total)?;
    let mut parked = park;
    for m in moves {
        remap(m.from, m.len, parked)?;
        parked += m.len;
    }

    let mut parked = park;
    for m in moves {
        remap(parked, m.len, m.to)?;
        parked += m.len;
    }

    Ok(())
}
