use std::io::{Read, Write};

use crate::error::{EngineError, Result};

use super::{read_string, read_u32, write_string};

/// The four-byte magic number identifying an engine file: ASCII "IBEN".
pub const ENGINE_MAGIC: [u8; 4] = *b"IBEN";

/// The only engine format version this runtime deserializes.
pub const ENGINE_VERSION: u32 = 1;

/// Alignment (in bytes) of the opaque payload within an engine file.
pub const ENGINE_PAYLOAD_ALIGNMENT: usize = 32;

/// Parsed engine file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineHeader {
    /// Engine format version.
    pub version: u32,
    /// Number of I/O tensors in the tensor table.
    pub n_tensors: u32,
    /// Name of the kernel entry point that executes the graph.
    pub kernel: String,
}

impl EngineHeader {
    /// Parse an engine header from the beginning of a reader.
    ///
    /// Reads and validates the 4-byte magic, then the version (u32 LE), the
    /// tensor count (u32 LE) and the kernel entry-point string.
    pub fn parse(reader: &mut impl Read) -> Result<EngineHeader> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != ENGINE_MAGIC {
            return Err(EngineError::InvalidMagic(magic));
        }

        let version = read_u32(reader)?;
        if version != ENGINE_VERSION {
            return Err(EngineError::UnsupportedVersion(version));
        }

        let n_tensors = read_u32(reader)?;
        let kernel = read_string(reader)?;
        if kernel.is_empty() {
            return Err(EngineError::GraphLoad("empty kernel entry point".to_string()));
        }

        Ok(EngineHeader {
            version,
            n_tensors,
            kernel,
        })
    }

    pub fn write(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_all(&ENGINE_MAGIC)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.n_tensors.to_le_bytes())?;
        write_string(writer, &self.kernel)
    }
}
