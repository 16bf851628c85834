use std::fs::File;
use std::io::{Cursor, ErrorKind};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{EngineError, Result};
use crate::registry::TensorDescriptor;

use super::header::{EngineHeader, ENGINE_PAYLOAD_ALIGNMENT};
use super::read_u64;
use super::tensor_table::parse_tensor_table;

/// A parsed engine file backed by a memory-mapped region.
///
/// The header and tensor table are parsed straight out of the mapping; the
/// opaque payload (weights, execution plan) stays mapped and is handed to
/// the device kernel as a slice.
pub struct EngineFile {
    /// Parsed header (version, tensor count, kernel entry point).
    pub header: EngineHeader,
    /// Tensor table entries in file order.
    pub tensors: Vec<TensorDescriptor>,
    /// Memory-mapped file contents.
    mmap: Mmap,
    /// Byte offset of the payload within the file (aligned).
    payload_offset: usize,
    /// Payload length in bytes.
    payload_len: usize,
}

impl EngineFile {
    /// Open and parse an engine file from disk.
    ///
    /// Corrupt tables and truncated files are reported as
    /// `EngineError::GraphLoad`; a missing file stays an `Io` error.
    pub fn open(path: &Path) -> Result<EngineFile> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < 4 {
            return Err(EngineError::GraphLoad(format!(
                "truncated engine file: {} bytes",
                file_len
            )));
        }

        // Memory-map the entire file.
        let mmap = unsafe { Mmap::map(&file)? };
        let (header, tensors, payload_offset, payload_len) =
            parse_layout(&mmap).map_err(truncation_to_graph_load)?;

        Ok(EngineFile {
            header,
            tensors,
            mmap,
            payload_offset,
            payload_len,
        })
    }

    /// The opaque payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.mmap[self.payload_offset..self.payload_offset + self.payload_len]
    }

    /// Total size of the mapped file.
    pub fn file_len(&self) -> usize {
        self.mmap.len()
    }
}

impl std::fmt::Debug for EngineFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineFile")
            .field("header", &self.header)
            .field("tensors", &self.tensors.len())
            .field("payload_len", &self.payload_len)
            .finish()
    }
}

type Layout = (EngineHeader, Vec<TensorDescriptor>, usize, usize);

fn parse_layout(bytes: &[u8]) -> Result<Layout> {
    let mut cursor = Cursor::new(bytes);
    let header = EngineHeader::parse(&mut cursor)?;
    let tensors = parse_tensor_table(&mut cursor, header.n_tensors)?;
    let payload_len = read_u64(&mut cursor)? as usize;

    // Align to ENGINE_PAYLOAD_ALIGNMENT to find where the payload starts.
    let current_pos = cursor.position() as usize;
    let payload_offset =
        (current_pos + ENGINE_PAYLOAD_ALIGNMENT - 1) & !(ENGINE_PAYLOAD_ALIGNMENT - 1);

    let fits = payload_offset
        .checked_add(payload_len)
        .is_some_and(|end| end <= bytes.len());
    if !fits {
        return Err(EngineError::GraphLoad(format!(
            "payload of {} bytes at offset {} extends past end of file ({} bytes)",
            payload_len,
            payload_offset,
            bytes.len()
        )));
    }

    Ok((header, tensors, payload_offset, payload_len))
}

fn truncation_to_graph_load(err: EngineError) -> EngineError {
    match err {
        EngineError::Io(e) if e.kind() == ErrorKind::UnexpectedEof => {
            EngineError::GraphLoad(format!("truncated engine file: {}", e))
        }
        other => other,
    }
}
