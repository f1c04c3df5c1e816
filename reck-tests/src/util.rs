use std::{
    env,
    io::Read,
    path::PathBuf,
    process::{self, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

static IMAGE_ID: AtomicU32 = AtomicU32::new(0);

/// A fresh checkpoint path under the temp dir, unique to this test process.
pub fn temp_image(name: &str) -> PathBuf {
    let id = IMAGE_ID.fetch_add(1, Ordering::Relaxed);
    env::temp_dir().join(format!("reck-test-{}-{id}-{name}.reck", process::id()))
}

pub struct ChildWithStreamedOutput {
    pub proc: process::Child,
    pub stdout: Arc<Mutex<String>>,
    pub stderr: Arc<Mutex<String>>,
    readers: Vec<JoinHandle<()>>,
}

impl ChildWithStreamedOutput {
    /// Waits for exit and for both streams to drain, returning stdout.
    pub fn finish(mut self) -> (ExitStatus, String) {
        let status = self.proc.wait().unwrap();
        for reader in self.readers.drain(..) {
            reader.join().unwrap();
        }

        let stdout = self.stdout.lock().unwrap().clone();
        (status, stdout)
    }
}

fn stream(mut pipe: impl Read + Send + 'static, pid: u32, sink: Arc<Mutex<String>>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut bbuf = [0u8; 1024];
        loop {
            let len = pipe.read(&mut bbuf).unwrap_or(0);
            if len == 0 {
                break;
            }
            let out = String::from_utf8_lossy(&bbuf[..len]).to_string();
            print!("{}", out.replace('\n', &format!("\n [{pid}] ")));
            sink.lock().unwrap().push_str(out.as_str());
        }
    })
}

pub fn spawn(cmd: &mut process::Command) -> ChildWithStreamedOutput {
    let mut proc = cmd
        .env("RUST_LOG", "debug")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn");

    let stdout = Arc::new(Mutex::new("".to_string()));
    let stderr = Arc::new(Mutex::new("".to_string()));

    let pid = proc.id();
    let readers = vec![
        stream(proc.stdout.take().unwrap(), pid, stdout.clone()),
        stream(proc.stderr.take().unwrap(), pid, stderr.clone()),
    ];

    ChildWithStreamedOutput {
        proc,
        stdout,
        stderr,
        readers,
    }
}

/// Waits until `contents` shows up on the child's stdout. Log lines go to
/// stderr and never match.
pub fn wait_for_stdout(child: &ChildWithStreamedOutput, contents: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if child.stdout.lock().unwrap().contains(contents) {
            return;
        }

        assert!(Instant::now() < deadline, "timed out waiting for {contents:?}");
        thread::sleep(Duration::from_millis(10));
    }
}
