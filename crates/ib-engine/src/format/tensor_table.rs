use std::io::{Read, Write};

use ib_tensor::{DataType, DeclaredShape, Dim};

use crate::error::{EngineError, Result};
use crate::registry::{TensorDescriptor, TensorDirection};

use super::{read_i64, read_string, read_u32, read_u8, write_string};

/// Maximum tensor rank an engine file may declare.
pub const MAX_RANK: u32 = 8;

/// Dimension value marking a dynamic axis; followed by the axis symbol.
const DYNAMIC_DIM: i64 = -1;

/// Parse `n_tensors` tensor table entries from a reader.
///
/// Each entry:
/// 1. engine string name
/// 2. u8 I/O mode (0 = input, 1 = output)
/// 3. u32 engine type ID (mapped via `DataType::from_engine_type`)
/// 4. u32 rank
/// 5. rank x i64 dimension; -1 is followed by the dynamic axis symbol
pub fn parse_tensor_table(reader: &mut impl Read, n_tensors: u32) -> Result<Vec<TensorDescriptor>> {
    let mut tensors = Vec::with_capacity(n_tensors.min(1024) as usize);
    for _ in 0..n_tensors {
        let name = read_string(reader)?;
        if name.is_empty() {
            return Err(EngineError::GraphLoad("tensor with empty name".to_string()));
        }

        let direction = match read_u8(reader)? {
            0 => TensorDirection::Input,
            1 => TensorDirection::Output,
            other => {
                return Err(EngineError::GraphLoad(format!(
                    "tensor '{}' has invalid I/O mode {}",
                    name, other
                )))
            }
        };

        let type_id = read_u32(reader)?;
        let dtype = DataType::from_engine_type(type_id).ok_or_else(|| {
            EngineError::GraphLoad(format!("tensor '{}' has unknown type ID {}", name, type_id))
        })?;

        let rank = read_u32(reader)?;
        if rank > MAX_RANK {
            return Err(EngineError::GraphLoad(format!(
                "tensor '{}' has rank {} (max {})",
                name, rank, MAX_RANK
            )));
        }

        let mut dims = Vec::with_capacity(rank as usize);
        for axis in 0..rank {
            let value = read_i64(reader)?;
            let dim = match value {
                DYNAMIC_DIM => {
                    let symbol = read_string(reader)?;
                    if symbol.is_empty() {
                        return Err(EngineError::GraphLoad(format!(
                            "tensor '{}' axis {} is dynamic but unnamed",
                            name, axis
                        )));
                    }
                    Dim::Dynamic(symbol)
                }
                n if n > 0 => Dim::Fixed(n as usize),
                n => {
                    return Err(EngineError::GraphLoad(format!(
                        "tensor '{}' axis {} has invalid size {}",
                        name, axis, n
                    )))
                }
            };
            dims.push(dim);
        }

        let shape = DeclaredShape::new(dims)
            .map_err(|e| EngineError::GraphLoad(format!("tensor '{}': {}", name, e)))?;

        tensors.push(TensorDescriptor {
            name,
            direction,
            dtype,
            shape,
        });
    }
    Ok(tensors)
}

/// Serialize one tensor table entry in the layout `parse_tensor_table` reads.
pub fn write_tensor_entry(writer: &mut impl Write, tensor: &TensorDescriptor) -> Result<()> {
    write_string(writer, &tensor.name)?;
    let mode: u8 = match tensor.direction {
        TensorDirection::Input => 0,
        TensorDirection::Output => 1,
    };
    writer.write_all(&[mode])?;
    writer.write_all(&tensor.dtype.to_engine_type().to_le_bytes())?;
    writer.write_all(&(tensor.shape.ndim() as u32).to_le_bytes())?;
    for dim in tensor.shape.dims() {
        match dim {
            Dim::Fixed(n) => writer.write_all(&(*n as i64).to_le_bytes())?,
            Dim::Dynamic(symbol) => {
                writer.write_all(&DYNAMIC_DIM.to_le_bytes())?;
                write_string(writer, symbol)?;
            }
        }
    }
    Ok(())
}
