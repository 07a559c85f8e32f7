//! Diagnostic array dumps.
//!
//! Intermediate buffers are written as NumPy `.npy` files (format 1.0,
//! little-endian `f32`, one dimension) so they can be inspected offline.

use crate::error::Result;
use crate::types::IQSample;
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const NPY_MAGIC: &[u8] = b"\x93NUMPY";
const NPY_PREAMBLE_LEN: usize = 10;
const NPY_ALIGN: usize = 64;

/// Write `values` to `writer` as a one-dimensional `<f4` array.
pub fn write_npy<W: Write>(writer: &mut W, values: &[f32]) -> Result<()> {
    let dict = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({},), }}",
        values.len()
    );
    // Header (dict + padding + '\n') ends on an alignment boundary
    let unpadded = NPY_PREAMBLE_LEN + dict.len() + 1;
    let padding = (NPY_ALIGN - unpadded % NPY_ALIGN) % NPY_ALIGN;
    let header_len = dict.len() + padding + 1;

    writer.write_all(NPY_MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_u16::<LittleEndian>(header_len as u16)?;
    writer.write_all(dict.as_bytes())?;
    writer.write_all(&vec![b' '; padding])?;
    writer.write_all(b"\n")?;
    for &v in values {
        writer.write_f32::<LittleEndian>(v)?;
    }
    Ok(())
}

/// Write `values` to a `.npy` file at `path`.
pub fn save_npy(path: &Path, values: &[f32]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_npy(&mut writer, values)?;
    writer.flush()?;
    Ok(())
}

/// Writes the measurement's intermediate buffers into one directory.
#[derive(Debug, Clone)]
pub struct DiagnosticDump {
    dir: PathBuf,
}

impl DiagnosticDump {
    /// File holding the normalized reference pulse
    pub const TX_NORM: &'static str = "txNorm.npy";
    /// File holding the normalized capture
    pub const RX_NORM: &'static str = "rxNorm.npy";
    /// File holding the raw in-phase capture
    pub const RX_RAW_I: &'static str = "rxRawI.npy";
    /// File holding the raw quadrature capture
    pub const RX_RAW_Q: &'static str = "rxRawQ.npy";

    /// Dump into `dir`, created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Target directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the normalized buffers and the raw capture split into I and Q.
    pub fn write(&self, tx_norm: &[f64], rx_norm: &[f64], rx_raw: &[IQSample]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let narrow = |v: &[f64]| -> Vec<f32> { v.iter().map(|&x| x as f32).collect() };
        let raw_i: Vec<f32> = rx_raw.iter().map(|s| s.re).collect();
        let raw_q: Vec<f32> = rx_raw.iter().map(|s| s.im).collect();

        save_npy(&self.dir.join(Self::TX_NORM), &narrow(tx_norm))?;
        save_npy(&self.dir.join(Self::RX_NORM), &narrow(rx_norm))?;
        save_npy(&self.dir.join(Self::RX_RAW_I), &raw_i)?;
        save_npy(&self.dir.join(Self::RX_RAW_Q), &raw_q)?;

        info!("Diagnostic arrays written to {}", self.dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, ReadBytesExt};
    use std::io::Cursor;

    fn parse_npy(bytes: &[u8]) -> (String, Vec<f32>) {
        assert_eq!(&bytes[..6], NPY_MAGIC);
        assert_eq!(&bytes[6..8], &[1, 0]);
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        let data_start = NPY_PREAMBLE_LEN + header_len;
        assert_eq!(data_start % NPY_ALIGN, 0);
        assert_eq!(bytes[data_start - 1], b'\n');
        let header = String::from_utf8(bytes[NPY_PREAMBLE_LEN..data_start].to_vec()).unwrap();

        let mut cursor = Cursor::new(&bytes[data_start..]);
        let mut values = Vec::new();
        while let Ok(v) = cursor.read_f32::<LittleEndian>() {
            values.push(v);
        }
        (header, values)
    }

    #[test]
    fn test_npy_layout() {
        let mut buf = Vec::new();
        write_npy(&mut buf, &[0.0, 0.5, 1.0]).unwrap();
        let (header, values) = parse_npy(&buf);
        assert!(header.starts_with("{'descr': '<f4', 'fortran_order': False, 'shape': (3,), }"));
        assert_eq!(values, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_npy_empty() {
        let mut buf = Vec::new();
        write_npy(&mut buf, &[]).unwrap();
        let (header, values) = parse_npy(&buf);
        assert!(header.contains("'shape': (0,)"));
        assert!(values.is_empty());
    }

    #[test]
    fn test_dump_writes_four_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dump = DiagnosticDump::new(tmp.path().join("run1"));
        let raw = vec![IQSample::new(0.25, -0.5), IQSample::new(1.0, 2.0)];
        dump.write(&[1.0], &[0.0, 1.0], &raw).unwrap();

        let read = |name: &str| parse_npy(&fs::read(dump.dir().join(name)).unwrap()).1;
        assert_eq!(read(DiagnosticDump::TX_NORM), vec![1.0]);
        assert_eq!(read(DiagnosticDump::RX_NORM), vec![0.0, 1.0]);
        assert_eq!(read(DiagnosticDump::RX_RAW_I), vec![0.25, 1.0]);
        assert_eq!(read(DiagnosticDump::RX_RAW_Q), vec![-0.5, 2.0]);
    }

    #[test]
    fn test_dump_uses_plotting_script_names() {
        let tmp = tempfile::tempdir().unwrap();
        let dump = DiagnosticDump::new(tmp.path());
        dump.write(&[1.0, 0.5], &[0.25, 1.0], &[IQSample::new(0.5, 0.5); 2]).unwrap();

        for name in ["txNorm.npy", "rxNorm.npy", "rxRawI.npy", "rxRawQ.npy"] {
            let bytes = fs::read(tmp.path().join(name)).unwrap();
            let (header, values) = parse_npy(&bytes);
            assert!(header.contains("'descr': '<f4'"), "{}: {}", name, header);
            assert_eq!(values.len(), 2);
            // 128-byte header followed by two float32 values
            assert_eq!(bytes.len(), 128 + 2 * 4);
        }
    }
}
