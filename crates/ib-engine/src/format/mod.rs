pub mod header;
pub mod reader;
pub mod tensor_table;
pub mod writer;

pub use header::{EngineHeader, ENGINE_MAGIC, ENGINE_PAYLOAD_ALIGNMENT, ENGINE_VERSION};
pub use reader::EngineFile;
pub use tensor_table::{parse_tensor_table, MAX_RANK};
pub use writer::EngineWriter;

use std::io::{Read, Write};

use crate::error::{EngineError, Result};

/// Upper bound on any string stored in an engine file (tensor names,
/// kernel names, axis symbols). Guards against huge allocations when a
/// corrupt length prefix is read.
const MAX_STRING_LEN: u64 = 1 << 16;

pub(crate) fn read_u8(reader: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub(crate) fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn read_i64(reader: &mut impl Read) -> Result<i64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

/// Read an engine string: u64 length followed by that many UTF-8 bytes.
pub(crate) fn read_string(reader: &mut impl Read) -> Result<String> {
    let len = read_u64(reader)?;
    if len > MAX_STRING_LEN {
        return Err(EngineError::GraphLoad(format!(
            "string length {} exceeds limit {}",
            len, MAX_STRING_LEN
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|e| EngineError::GraphLoad(format!("invalid UTF-8 in string: {}", e)))
}

pub(crate) fn write_string(writer: &mut impl Write, s: &str) -> Result<()> {
    writer.write_all(&(s.len() as u64).to_le_bytes())?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}
