//! Counts to four, checkpointing itself at two.
//!
//! `counter dump <PATH> [--threads N]` runs the sequence and writes the
//! checkpoint; `counter restore <PATH>` resumes it, which prints the rest of
//! the sequence. Right after the checkpoint both print a checksum of memory
//! filled before it.

use std::{
    collections::hash_map::DefaultHasher,
    env,
    hash::{Hash, Hasher},
    hint::black_box,
    process::{self, ExitCode},
    thread,
};

use reck::{make_checkpoint, restore_serialized_file, Outcome};
use reck_common::tracing::{error, Console};

const CHECKPOINT_AT: u32 = 2;

fn usage() -> ExitCode {
    error!("usage: counter dump <PATH> [--threads N] | counter restore <PATH>");
    ExitCode::from(2)
}

fn checksum(values: &[u64]) -> u64 {
    let mut hasher = DefaultHasher::new();
    values.hash(&mut hasher);
    hasher.finish()
}

fn count(console: &Console, path: &str) -> ExitCode {
    // differs from run to run, so only restored memory can reproduce it
    let seed = u64::from(process::id()).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    let heap = (0..0x4000u64).map(|i| seed ^ i.rotate_left(17)).collect::<Vec<_>>();
    let mut stack = [0u64; 64];
    for (i, value) in stack.iter_mut().enumerate() {
        *value = seed.rotate_right(i as u32);
    }

    for i in 0..5 {
        console.println(i);

        if i == CHECKPOINT_AT {
            match make_checkpoint(path) {
                Ok(Outcome::Dumped) => console.println("checkpointed"),
                Ok(Outcome::Restored) => console.println("restored"),
                Err(e) => {
                    error!("{e:?}");
                    return ExitCode::FAILURE;
                }
            }
            console.println(format!(
                "checksum {:016x} {:016x}",
                checksum(black_box(&heap)),
                checksum(black_box(&stack))
            ));
        }
    }

    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    let console = reck_common::tracing::init();
    let args = env::args().skip(1).collect::<Vec<_>>();
    let args = args.iter().map(String::as_str).collect::<Vec<_>>();

    match args[..] {
        ["dump", path] => count(&console, path),
        ["dump", path, "--threads", n] => {
            let Ok(n) = n.parse::<usize>() else {
                return usage();
            };

            // idle until the process exits
            for _ in 0..n {
                thread::spawn(|| loop {
                    thread::park();
                });
            }

            count(&console, path)
        }
        ["restore", path] => match restore_serialized_file(path) {
            Ok(never) => match never {},
            Err(e) => {
                error!("{e:?}");
                ExitCode::FAILURE
            }
        },
        _ => usage(),
    }
}
