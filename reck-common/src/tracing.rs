//! Logging setup shared by every reck binary.
//!
//! Log lines and user-facing output are serialized through one [`Console`]
//! handle: the subscriber holds a clone as its writer, callers print through
//! another clone.

use std::{
    fmt::Display,
    io::{self, Write},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use ::tracing::subscriber::DefaultGuard;
use tracing_subscriber::{fmt::MakeWriter, util::SubscriberInitExt, EnvFilter};

pub use ::tracing::*;

#[derive(Clone, Default)]
pub struct Console {
    lock: Arc<Mutex<()>>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prints one line to stdout without interleaving with log output.
    pub fn println(&self, line: impl Display) {
        let _guard = self.lock();
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{line}");
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Writer for a single log line; the console stays locked until it is dropped.
pub struct ConsoleWriter<'a> {
    _guard: MutexGuard<'a, ()>,
    out: io::Stderr,
}

impl Write for ConsoleWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl<'a> MakeWriter<'a> for Console {
    type Writer = ConsoleWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        ConsoleWriter {
            _guard: self.lock(),
            out: io::stderr(),
        }
    }
}

fn build_subscriber(console: Console) -> impl Subscriber + Send + Sync + 'static {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(console)
        .finish()
}

/// Installs the global subscriber (filter from `RUST_LOG`, default `info`).
///
/// Only the first call installs anything; later calls hand back a console
/// that is not shared with the subscriber.
pub fn init() -> Console {
    let console = Console::new();
    let _ = build_subscriber(console.clone()).try_init();
    console
}

/// Gives the calling thread of a freshly forked child a console of its own.
///
/// The inherited console may be locked by a thread that was not copied into
/// the child. Nothing is installed if logging was [`silenced`] at the fork.
pub fn after_fork() -> Option<DefaultGuard> {
    if is_silenced() {
        return None;
    }
    Some(::tracing::subscriber::set_default(build_subscriber(Console::new())))
}

/// Runs `f` with logging switched off on this thread.
///
/// Log lines carry a timestamp; this is for code that must not read the clock.
pub fn silenced<T>(f: impl FnOnce() -> T) -> T {
    ::tracing::subscriber::with_default(Silent, f)
}

pub fn is_silenced() -> bool {
    dispatcher::get_default(|dispatch| dispatch.is::<Silent>())
}

struct Silent;

impl Subscriber for Silent {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        false
    }

    fn new_span(&self, _: &span::Attributes<'_>) -> span::Id {
        span::Id::from_u64(1)
    }

    fn record(&self, _: &span::Id, _: &span::Record<'_>) {}

    fn record_follows_from(&self, _: &span::Id, _: &span::Id) {}

    fn event(&self, _: &Event<'_>) {}

    fn enter(&self, _: &span::Id) {}

    fn exit(&self, _: &span::Id) {}
}
