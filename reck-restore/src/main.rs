use std::{env, path::PathBuf, process::ExitCode};

use reck_common::tracing::error;
use reck_restore::{restore_serialized_file, IMAGE_ENV};

fn main() -> ExitCode {
    reck_common::tracing::init();

    let Some(path) = env::var_os(IMAGE_ENV).or_else(|| env::args_os().nth(1)) else {
        error!("usage: reck-restore <PATH> (or set {IMAGE_ENV})");
        return ExitCode::from(2);
    };

    match restore_serialized_file(PathBuf::from(path)) {
        Ok(never) => match never {},
        Err(e) => {
            error!("restore failed: {e:?}");
            ExitCode::FAILURE
        }
    }
}
