//! NPY file reading and writing
//!
//! Tensors cross the boundary to external runners as NumPy `.npy` files:
//! version 1.0, little-endian `<f4`, C order.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// NPY array data
#[derive(Debug, Clone)]
pub struct NpyArray {
    /// Shape of the array
    pub shape: Vec<usize>,
    /// Data type string (e.g., "<f4")
    pub dtype: String,
    /// Whether the data is stored column-major
    pub fortran_order: bool,
    /// Raw data bytes
    pub data: Vec<u8>,
}

impl NpyArray {
    /// Get as f32 vector, widening or narrowing from f8 if needed
    pub fn as_f32(&self) -> Result<Vec<f32>> {
        match self.dtype.as_str() {
            "<f4" | "|f4" => Ok(self
                .data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()),
            "<f8" => Ok(self
                .data
                .chunks_exact(8)
                .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
                .collect()),
            other => anyhow::bail!("Expected little-endian float, got {}", other),
        }
    }

    /// Convert to a CPU tensor with the array's shape
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        if self.fortran_order {
            anyhow::bail!("Fortran-ordered arrays are not supported");
        }
        let data = self.as_f32()?;
        Ok(Tensor::from_vec(data, self.shape.as_slice(), device)?)
    }
}

/// Load an NPY file
pub fn load_npy<P: AsRef<Path>>(path: P) -> Result<NpyArray> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open NPY file: {:?}", path))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if &magic != NPY_MAGIC {
        anyhow::bail!("Invalid NPY magic number in {:?}", path);
    }

    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;

    let header_len = if version[0] == 1 {
        let mut len_bytes = [0u8; 2];
        reader.read_exact(&mut len_bytes)?;
        u16::from_le_bytes(len_bytes) as usize
    } else {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        u32::from_le_bytes(len_bytes) as usize
    };

    let mut header_bytes = vec![0u8; header_len];
    reader.read_exact(&mut header_bytes)?;
    let header = String::from_utf8_lossy(&header_bytes);

    let dtype = parse_dtype(&header)?;
    let shape = parse_shape(&header)?;
    let fortran_order = header.contains("'fortran_order': True");

    let elem_size: usize = match dtype.get(1..) {
        Some("f4" | "i4") => 4,
        Some("f8" | "i8") => 8,
        Some("i2") => 2,
        Some("u1") => 1,
        _ => anyhow::bail!("Unsupported dtype: {}", dtype),
    };
    let data_size = shape
        .iter()
        .try_fold(elem_size, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| anyhow::anyhow!("Shape {:?} overflows the data size", shape))?;

    let mut data = vec![0u8; data_size];
    reader
        .read_exact(&mut data)
        .with_context(|| format!("Truncated NPY data in {:?}", path))?;

    Ok(NpyArray {
        shape,
        dtype,
        fortran_order,
        data,
    })
}

/// Load NPY file as an f32 tensor
pub fn load_npy_tensor<P: AsRef<Path>>(path: P, device: &Device) -> Result<Tensor> {
    load_npy(path)?.to_tensor(device)
}

/// Write f32 data as an NPY v1.0 file
pub fn save_npy_f32<P: AsRef<Path>>(path: P, data: &[f32], shape: &[usize]) -> Result<()> {
    let path = path.as_ref();
    anyhow::ensure!(
        data.len() == shape.iter().product::<usize>(),
        "{} values do not fill shape {:?}",
        data.len(),
        shape
    );

    let header = npy_header("<f4", shape);
    let file = File::create(path)
        .with_context(|| format!("Failed to create NPY file: {:?}", path))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(NPY_MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_all(&(header.len() as u16).to_le_bytes())?;
    writer.write_all(header.as_bytes())?;
    for v in data {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Write a tensor as an f32 NPY file
pub fn save_npy_tensor<P: AsRef<Path>>(path: P, tensor: &Tensor) -> Result<()> {
    let data: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    save_npy_f32(path, &data, tensor.dims())
}

/// Header dict padded with spaces so the data starts on a 64-byte boundary
fn npy_header(dtype: &str, shape: &[usize]) -> String {
    let shape_str = match shape {
        [d] => format!("({},)", d),
        dims => format!(
            "({})",
            dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        dtype, shape_str
    );
    // magic(6) + version(2) + len(2) + header + '\n'
    let unpadded = 10 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    header.extend(std::iter::repeat(' ').take(padding));
    header.push('\n');
    header
}

/// Parse dtype from NPY header
fn parse_dtype(header: &str) -> Result<String> {
    let start = header.find("'descr'")
        .or_else(|| header.find("\"descr\""))
        .ok_or_else(|| anyhow::anyhow!("No descr in header"))?;

    let rest = &header[start + "'descr'".len()..];
    let colon = rest.find(':').ok_or_else(|| anyhow::anyhow!("No colon after descr"))?;
    let after_colon = &rest[colon + 1..];

    let quote_start = after_colon.find(['\'', '"'])
        .ok_or_else(|| anyhow::anyhow!("No dtype string"))?;
    let quote_char = &after_colon[quote_start..quote_start + 1];
    let dtype_start = quote_start + 1;
    let dtype_end = after_colon[dtype_start..].find(quote_char)
        .ok_or_else(|| anyhow::anyhow!("Unclosed dtype string"))?;

    let dtype = &after_colon[dtype_start..dtype_start + dtype_end];
    if dtype.len() < 2 {
        anyhow::bail!("Malformed dtype: {}", dtype);
    }
    Ok(dtype.to_string())
}

/// Parse shape from NPY header
fn parse_shape(header: &str) -> Result<Vec<usize>> {
    let start = header.find("'shape'")
        .or_else(|| header.find("\"shape\""))
        .ok_or_else(|| anyhow::anyhow!("No shape in header"))?;

    let rest = &header[start..];
    let paren_start = rest.find('(')
        .ok_or_else(|| anyhow::anyhow!("No shape tuple"))?;
    let tuple = &rest[paren_start + 1..];
    let paren_end = tuple.find(')')
        .ok_or_else(|| anyhow::anyhow!("Unclosed shape tuple"))?;

    tuple[..paren_end]
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|e| anyhow::anyhow!("Invalid shape element: {}", e))
        })
        .collect()
}
