pub mod mmap;
pub mod restore;
pub mod vdso;

pub use restore::restore_serialized_file;

/// Environment variable naming the checkpoint to restore.
pub const IMAGE_ENV: &str = "RECK_IMAGE";
