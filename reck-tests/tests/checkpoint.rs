use std::{fs, path::Path, process, time::Duration};

use reck::{inspect, read_serialized_mdata};
use reck_common::{
    image::ImageReader,
    proto::{BlockKind, MAGIC},
};
use reck_tests::util::{spawn, temp_image, wait_for_stdout};

fn counter() -> process::Command {
    process::Command::new(env!("CARGO_BIN_EXE_counter"))
}

fn dump(path: &Path, threads: usize) -> String {
    let mut cmd = counter();
    cmd.arg("dump").arg(path);
    if threads > 0 {
        cmd.args(["--threads", &threads.to_string()]);
    }

    let (code, stdout) = spawn(&mut cmd).finish();
    assert!(code.success(), "counter failed: {code}");
    stdout
}

fn checksum(stdout: &str) -> &str {
    stdout
        .lines()
        .find(|line| line.starts_with("checksum "))
        .expect("no checksum printed")
}

fn count(path: &Path, kind: BlockKind) -> usize {
    read_serialized_mdata(path)
        .unwrap()
        .iter()
        .filter(|e| e.kind == kind)
        .count()
}

#[test]
fn checkpoint_keeps_the_process_running() {
    let path = temp_image("running");

    let stdout = dump(&path, 0);
    let lines = stdout.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 7, "{stdout}");
    assert_eq!(lines[..4], ["0", "1", "2", "checkpointed"]);
    assert!(lines[4].starts_with("checksum "));
    assert_eq!(lines[5..], ["3", "4"]);

    fs::remove_file(path).unwrap();
}

#[test]
fn checkpoint_has_a_well_formed_index() {
    let path = temp_image("index");
    dump(&path, 0);

    let bytes = fs::read(&path).unwrap();
    assert_eq!(bytes[..4], MAGIC);

    let index = read_serialized_mdata(&path).unwrap();
    let kinds = index.iter().map(|e| e.kind).collect::<Vec<_>>();
    assert_eq!(kinds[..2], [BlockKind::Regs, BlockKind::FpRegs]);
    assert!(kinds[2..]
        .iter()
        .all(|k| *k == BlockKind::MemoryMap || *k == BlockKind::VdsoMap));
    assert!(kinds.contains(&BlockKind::MemoryMap));

    assert!(index.windows(2).all(|w| w[0].end().unwrap() < w[1].offset));
    assert_eq!(index.last().unwrap().end(), Some(bytes.len() as u64));

    fs::remove_file(path).unwrap();
}

#[test]
fn checkpoint_skips_kernel_regions() {
    let path = temp_image("restricted");
    dump(&path, 0);

    let mut image = ImageReader::open(&path).unwrap();
    let mut names = vec![];
    let mut placed = vec![];
    for entry in image.index().unwrap() {
        match entry.kind {
            BlockKind::MemoryMap => {
                let (region, len) = image.read_region(&entry).unwrap();
                assert!(!region.is_restricted(), "{region}");
                assert!(len == 0 || len as u64 == region.size());
                names.push(region.pathname);
            }
            BlockKind::VdsoMap => {
                let (region, len) = image.read_region(&entry).unwrap();
                assert!(region.is_vdso(), "{region}");
                assert_eq!(len, 0);
                placed.push(region.pathname);
            }
            _ => {}
        }
    }

    assert!(names.iter().any(|n| n == "[stack]"));
    assert!(!names.iter().any(|n| n == "[vdso]" || n == "[vvar]"));
    assert!(placed.iter().any(|n| n == "[vdso]"));

    fs::remove_file(path).unwrap();
}

#[test]
fn checkpoint_captures_every_thread() {
    let path = temp_image("threads");
    dump(&path, 3);

    assert_eq!(count(&path, BlockKind::Regs), 4);
    assert_eq!(count(&path, BlockKind::FpRegs), 4);

    fs::remove_file(path).unwrap();
}

#[test]
fn checkpoint_can_be_inspected() {
    let path = temp_image("inspect");
    dump(&path, 0);

    let index = read_serialized_mdata(&path).unwrap();
    let lines = inspect::render(&path, false, false).unwrap();
    assert_eq!(lines.len(), index.len());
    assert!(lines[0].starts_with("REGS offset: 24 "));

    let lines = inspect::render(&path, true, false).unwrap();
    assert_eq!(lines.len(), 2 * index.len() - 2);

    fs::remove_file(path).unwrap();
}

#[test]
fn restore_resumes_the_sequence() {
    let path = temp_image("restore");
    let dumped = dump(&path, 0);

    let restored = spawn(counter().arg("restore").arg(&path));
    wait_for_stdout(&restored, "restored\n", Duration::from_secs(10));

    let (code, stdout) = restored.finish();
    assert!(code.success(), "restore failed: {code}");
    assert!(stdout.starts_with("restored\n"), "{stdout}");
    assert!(stdout.ends_with("\n3\n4\n"), "{stdout}");

    // heap and stack came back as they were at the dump
    assert_eq!(checksum(&stdout), checksum(&dumped));

    fs::remove_file(path).unwrap();
}
