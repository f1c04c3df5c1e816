//! Writing and scanning checkpoint files.

use std::{
    fs::{File, OpenOptions},
    io::{self as stdio, BufReader, BufWriter, ErrorKind, Seek, SeekFrom, Write},
    mem::size_of,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use crate::{
    error::{CheckpointError, Result},
    io::{read_full, write_full},
    maps::MemoryRegion,
    proto::{config, BlockEntry, BlockKind, RegionRecord, MAGIC},
    regs::{self, RegisterSet},
    tracing::trace,
};

/// Sequential writer of a fresh checkpoint file.
///
/// The file is closed when the writer is dropped, whichever way the dump ends.
pub struct ImageWriter {
    file: BufWriter<File>,
    path: PathBuf,
    position: u64,
    entry_len: usize,
}

impl ImageWriter {
    /// Truncates or creates `path` and writes the header.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(CheckpointError::io(format!("creating {}", path.display())))?;

        let mut writer = Self {
            file: BufWriter::new(file),
            path,
            position: 0,
            entry_len: BlockEntry::encoded_len()?,
        };
        writer.write_all(&MAGIC)?;

        Ok(writer)
    }

    pub fn write_registers<T: RegisterSet>(&mut self, kind: BlockKind, set: &T) -> Result<BlockEntry> {
        self.write_block(kind, regs::as_bytes(set))
    }

    pub fn write_block(&mut self, kind: BlockKind, payload: &[u8]) -> Result<BlockEntry> {
        let entry = self.write_entry(kind, payload.len())?;
        self.write_all(payload)?;
        Ok(entry)
    }

    /// Writes a region record followed by `content`, which is either the whole
    /// region or empty for regions that could not be read.
    pub fn write_region(&mut self, region: &MemoryRegion, content: &[u8]) -> Result<BlockEntry> {
        let record = bincode::encode_to_vec(RegionRecord::from(region), config())?;
        let entry = self.write_entry(BlockKind::MemoryMap, record.len() + content.len())?;
        self.write_all(&record)?;
        self.write_all(content)?;
        Ok(entry)
    }

    /// Records where a vdso region sits. Its content belongs to the kernel and
    /// is not stored.
    pub fn write_vdso(&mut self, region: &MemoryRegion) -> Result<BlockEntry> {
        let record = bincode::encode_to_vec(RegionRecord::from(region), config())?;
        self.write_block(BlockKind::VdsoMap, &record)
    }

    pub fn finish(mut self) -> Result<()> {
        self.file
            .flush()
            .map_err(CheckpointError::io(format!("flushing {}", self.path.display())))
    }

    fn write_entry(&mut self, kind: BlockKind, size: usize) -> Result<BlockEntry> {
        let entry = BlockEntry {
            kind,
            offset: self.position + self.entry_len as u64,
            size: size as u64,
        };
        trace!("{entry}");

        let buf = bincode::encode_to_vec(entry, config())?;
        self.write_all(&buf)?;
        Ok(entry)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let context = || format!("writing {}", self.path.display());
        let written = write_full(&mut self.file, buf).map_err(CheckpointError::io(context()))?;
        if written != buf.len() {
            return Err(CheckpointError::io(context())(ErrorKind::WriteZero.into()));
        }
        self.position += written as u64;
        Ok(())
    }
}

/// Random-access reader of an existing checkpoint file.
pub struct ImageReader {
    file: BufReader<File>,
    path: PathBuf,
}

impl ImageReader {
    /// Opens `path` and checks the header magic.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(CheckpointError::io(format!("opening {}", path.display())))?;

        let mut reader = Self {
            file: BufReader::new(file),
            path,
        };

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(CheckpointError::BadMagic {
                found: magic,
                expected: MAGIC,
            });
        }

        Ok(reader)
    }

    /// Scans the block index without reading payloads. The scan ends at the
    /// first entry that cannot be read in full.
    pub fn index(&mut self) -> Result<Vec<BlockEntry>> {
        let entry_len = BlockEntry::encoded_len()?;
        let mut buf = vec![0u8; entry_len];
        let mut position = MAGIC.len() as u64;
        let mut index = vec![];

        self.seek(position)?;
        loop {
            let read = read_full(&mut self.file, &mut buf).map_err(self.io_error("reading"))?;
            if read != entry_len {
                break;
            }

            let (entry, _): (BlockEntry, usize) = bincode::decode_from_slice(&buf, config())?;
            if entry.offset != position + entry_len as u64 {
                return Err(CheckpointError::OffsetMismatch {
                    position,
                    offset: entry.offset,
                });
            }
            trace!("{entry}");

            position = entry.end().ok_or(CheckpointError::Overflow {
                kind: entry.kind,
                offset: entry.offset,
                size: entry.size,
            })?;
            self.seek(position)?;
            index.push(entry);
        }

        Ok(index)
    }

    pub fn read_registers<T: RegisterSet>(&mut self, entry: &BlockEntry) -> Result<T> {
        let mut buf = vec![0u8; size_of::<T>()];
        if entry.size != buf.len() as u64 {
            return Err(CheckpointError::SizeMismatch {
                kind: entry.kind,
                expected: buf.len() as u64,
                actual: entry.size,
            });
        }

        self.seek(entry.offset)?;
        self.read_exact(&mut buf)?;

        // lengths match, so this cannot fail
        regs::from_bytes(&buf).ok_or(CheckpointError::ShortRead {
            expected: size_of::<T>(),
            actual: buf.len(),
        })
    }

    /// Reads the region record of a MEMORY_MAP or VDSO_MAP block and returns it
    /// with the length of the content that follows. The reader is left at the
    /// content.
    pub fn read_region(&mut self, entry: &BlockEntry) -> Result<(MemoryRegion, usize)> {
        let record_len = RegionRecord::encoded_len()?;
        let holds_region = matches!(entry.kind, BlockKind::MemoryMap | BlockKind::VdsoMap);
        if !holds_region || entry.size < record_len as u64 {
            return Err(CheckpointError::SizeMismatch {
                kind: entry.kind,
                expected: record_len as u64,
                actual: entry.size,
            });
        }

        let mut buf = vec![0u8; record_len];
        self.seek(entry.offset)?;
        self.read_exact(&mut buf)?;
        let (record, _): (RegionRecord, usize) = bincode::decode_from_slice(&buf, config())?;
        let region = MemoryRegion::from(&record);

        let content_len = entry.size - record_len as u64;
        if entry.kind == BlockKind::VdsoMap && content_len != 0 {
            return Err(CheckpointError::SizeMismatch {
                kind: entry.kind,
                expected: record_len as u64,
                actual: entry.size,
            });
        }
        if content_len != 0 && content_len != region.size() {
            return Err(CheckpointError::SizeMismatch {
                kind: entry.kind,
                expected: record_len as u64 + region.size(),
                actual: entry.size,
            });
        }

        Ok((region, content_len as usize))
    }

    /// Reads region content following a [`read_region`](Self::read_region) call.
    pub fn read_content(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_exact(buf)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let read = read_full(&mut self.file, buf).map_err(self.io_error("reading"))?;
        if read != buf.len() {
            return Err(CheckpointError::ShortRead {
                expected: buf.len(),
                actual: read,
            });
        }
        Ok(())
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(position))
            .map_err(self.io_error("seeking in"))?;
        Ok(())
    }

    fn io_error(&self, what: &str) -> impl FnOnce(stdio::Error) -> CheckpointError {
        CheckpointError::io(format!("{what} {}", self.path.display()))
    }
}

/// Reads the block index of the checkpoint at `path`.
pub fn read_serialized_mdata(path: impl AsRef<Path>) -> Result<Vec<BlockEntry>> {
    ImageReader::open(path)?.index()
}
