use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rkyv::AlignedVec;
use tracing::warn;

use crate::model::Batch;

/// Upper bound on a single archived batch. Anything larger in a length
/// prefix is treated as corruption.
const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

/// Where a batch landed and what keys it carried.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedBatch {
    pub offset: u64,
    pub keys: Vec<String>,
}

/// Append-only data file of length-prefixed, archived batches:
/// `[Length (4b)][Archived Batch (N bytes)]`.
#[derive(Debug)]
pub struct Segment {
    pub file_path: PathBuf,
    file: File,
    strict: bool,
    current_offset: u64,
}

impl Segment {
    /// Opens or creates the segment. `strict` fsyncs after every append.
    pub fn new(path: &Path, strict: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let current_offset = file.metadata()?.len();

        Ok(Self {
            file_path: path.to_path_buf(),
            file,
            strict,
            current_offset,
        })
    }

    pub fn len(&self) -> u64 {
        self.current_offset
    }

    pub fn is_empty(&self) -> bool {
        self.current_offset == 0
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Appends a batch as one entry and returns its offset. The whole batch
    /// becomes visible on recovery or none of it does.
    pub fn append(&mut self, batch: &Batch) -> io::Result<u64> {
        let bytes = rkyv::to_bytes::<_, 4096>(batch)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        if bytes.len() > MAX_ENTRY_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("batch of {} bytes exceeds the entry limit", bytes.len()),
            ));
        }

        let start = self.current_offset;

        // Single write so a crash leaves at most one torn entry at the tail.
        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        frame.extend_from_slice(&bytes);
        self.file.write_all(&frame)?;
        if self.strict {
            self.file.sync_data()?;
        }

        self.current_offset += frame.len() as u64;
        Ok(start)
    }

    /// Reads the value stored at `position` of the batch at `offset`.
    pub fn read_value(&mut self, offset: u64, position: usize) -> io::Result<Vec<u8>> {
        let bytes = self.read_entry(offset)?;
        let batch = archived_batch(&bytes)?;
        batch
            .entries
            .get(position)
            .map(|entry| entry.value.to_vec())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("batch at {} has no entry {}", offset, position),
                )
            })
    }

    /// Walks every complete batch from the start of the file. A torn or
    /// unreadable tail is truncated away so later appends start clean.
    pub fn scan(&mut self) -> io::Result<Vec<ScannedBatch>> {
        let mut batches = Vec::new();
        let mut offset = 0u64;

        while offset < self.current_offset {
            match self.read_entry(offset) {
                Ok(bytes) => match archived_batch(&bytes) {
                    Ok(batch) => {
                        let keys = batch.entries.iter().map(|e| e.key.as_str().to_string()).collect();
                        batches.push(ScannedBatch { offset, keys });
                        offset += 4 + bytes.len() as u64;
                    }
                    Err(e) => {
                        warn!("Segment {:?}: corrupt entry at {}: {}", self.file_path, offset, e);
                        break;
                    }
                },
                Err(e) => {
                    warn!("Segment {:?}: torn entry at {}: {}", self.file_path, offset, e);
                    break;
                }
            }
        }

        if offset < self.current_offset {
            warn!(
                "Segment {:?}: truncating {} trailing bytes",
                self.file_path,
                self.current_offset - offset
            );
            self.file.set_len(offset)?;
            self.current_offset = offset;
        }

        Ok(batches)
    }

    fn read_entry(&mut self, offset: u64) -> io::Result<AlignedVec> {
        self.file.seek(SeekFrom::Start(offset))?;

        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_ENTRY_SIZE || offset + 4 + len as u64 > self.current_offset {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "entry runs past end of segment"));
        }

        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;

        let mut aligned = AlignedVec::with_capacity(len);
        aligned.extend_from_slice(&buf);
        Ok(aligned)
    }
}

fn archived_batch(bytes: &[u8]) -> io::Result<&<Batch as rkyv::Archive>::Archived> {
    rkyv::check_archived_root::<Batch>(bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}
