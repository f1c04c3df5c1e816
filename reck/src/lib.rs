//! Userspace checkpoint and restore of Linux processes.
//!
//! A process checkpoints itself with [`make_checkpoint`], or another process
//! is dumped with [`dump_serialized_file`]. [`restore_serialized_file`] rebuilds
//! a checkpoint inside the calling process and continues from it.

pub mod args;
pub mod destination;
pub mod inspect;
pub mod origin;

use std::process::ExitCode;

use clap::Parser;
use reck_common::{
    anyhow::Result,
    nix::unistd::Pid,
    tracing::{error, Console},
};

use crate::args::{Args, Command};

pub use origin::{dump_serialized_file, make_checkpoint, Outcome};
pub use reck_common::image::read_serialized_mdata;
pub use reck_restore::restore_serialized_file;

pub fn main() -> ExitCode {
    let console = reck_common::tracing::init();
    let args = Args::parse();

    match run(&console, args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(console: &Console, args: Args) -> Result<()> {
    match args.command {
        Command::Dump { pid, path } => dump_serialized_file(Pid::from_raw(pid), path),
        Command::Inspect {
            path,
            regions,
            json,
        } => inspect::inspect(console, &path, regions, json),
        Command::Restore { path } => match destination::exec_restore(&path)? {},
    }
}
