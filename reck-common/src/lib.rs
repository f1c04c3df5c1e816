pub mod error;
pub mod helper;
pub mod image;
pub mod io;
pub mod maps;
pub mod proto;
pub mod ptracer;
pub mod regs;
pub mod tracing;

pub use anyhow;
pub use libc;
pub use nix;
pub use procfs;
pub use serde_json;
