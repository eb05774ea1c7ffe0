//! Raw sample persistence
//!
//! Two kinds of files cross the process boundary:
//!
//! - **Debug dumps** of intermediate pipeline buffers. These are header-less,
//!   row-major runs of native-endian values so that a capture can be replayed
//!   and compared element by element against another implementation.
//! - **Attack waveforms** prepared offline, stored as interleaved complex
//!   samples in one of the [`IqFormat`] encodings.
//!
//! | Format | Bytes/Sample | Description |
//! |--------|--------------|-------------|
//! | Cf64   | 16           | Complex float64 |
//! | Cf32   | 8            | Complex float32, USRP/GNU Radio compatible |
//! | Ci16   | 4            | Complex int16, scaled to [-1.0, 1.0] |

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::types::IQSample;

/// A value that can be written to and read from a raw dump file.
pub trait RawSample: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    fn write_ne<W: Write>(&self, writer: &mut W) -> io::Result<()>;

    fn read_ne<R: Read>(reader: &mut R) -> io::Result<Self>;
}

macro_rules! impl_raw_scalar {
    ($($ty:ty),*) => {
        $(
            impl RawSample for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn write_ne<W: Write>(&self, writer: &mut W) -> io::Result<()> {
                    writer.write_all(&self.to_ne_bytes())
                }

                fn read_ne<R: Read>(reader: &mut R) -> io::Result<Self> {
                    let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                    reader.read_exact(&mut bytes)?;
                    Ok(<$ty>::from_ne_bytes(bytes))
                }
            }
        )*
    };
}

impl_raw_scalar!(f64, f32, i32, u64);

impl<T: RawSample> RawSample for Complex<T> {
    const SIZE: usize = 2 * T::SIZE;

    fn write_ne<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.re.write_ne(writer)?;
        self.im.write_ne(writer)
    }

    fn read_ne<R: Read>(reader: &mut R) -> io::Result<Self> {
        let re = T::read_ne(reader)?;
        let im = T::read_ne(reader)?;
        Ok(Complex::new(re, im))
    }
}

/// Write `values` back to back with no header.
pub fn write_raw_file<T: RawSample>(path: impl AsRef<Path>, values: &[T]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for value in values {
        value.write_ne(&mut writer)?;
    }
    writer.flush()
}

/// Read a whole raw dump. Trailing bytes that do not form a full value are
/// reported as `InvalidData`.
pub fn read_raw_file<T: RawSample>(path: impl AsRef<Path>) -> io::Result<Vec<T>> {
    let file = File::open(path)?;
    let len = file.metadata()?.len() as usize;
    if len % T::SIZE != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("file length {} is not a multiple of {} bytes", len, T::SIZE),
        ));
    }

    let mut reader = BufReader::new(file);
    (0..len / T::SIZE).map(|_| T::read_ne(&mut reader)).collect()
}

// ---------------------------------------------------------------------------
// IqFormat
// ---------------------------------------------------------------------------

/// Encoding of an attack waveform file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IqFormat {
    /// Complex float64 (16 bytes/sample)
    Cf64,
    /// Complex float32 (8 bytes/sample), the format UHD tools write
    #[default]
    Cf32,
    /// Complex signed int16 (4 bytes/sample)
    Ci16,
}

impl IqFormat {
    /// Size of one I/Q sample in bytes.
    #[inline]
    pub const fn bytes_per_sample(&self) -> usize {
        match self {
            IqFormat::Cf64 => 16,
            IqFormat::Cf32 => 8,
            IqFormat::Ci16 => 4,
        }
    }

    /// Parse a format name, accepting the usual aliases.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "f64" | "cf64" | "cf64_le" | "complex64" => Some(IqFormat::Cf64),
            "f32" | "cf32" | "cf32_le" | "ettus" | "float" => Some(IqFormat::Cf32),
            "i16" | "ci16" | "ci16_le" | "sc16" | "short" => Some(IqFormat::Ci16),
            _ => None,
        }
    }

    /// Decode one sample from little-endian bytes.
    ///
    /// `bytes` must hold at least [`bytes_per_sample`](Self::bytes_per_sample) bytes.
    pub fn decode(&self, bytes: &[u8]) -> IQSample {
        match self {
            IqFormat::Cf64 => {
                let mut re = [0u8; 8];
                let mut im = [0u8; 8];
                re.copy_from_slice(&bytes[0..8]);
                im.copy_from_slice(&bytes[8..16]);
                IQSample::new(f64::from_le_bytes(re), f64::from_le_bytes(im))
            }
            IqFormat::Cf32 => {
                let mut re = [0u8; 4];
                let mut im = [0u8; 4];
                re.copy_from_slice(&bytes[0..4]);
                im.copy_from_slice(&bytes[4..8]);
                IQSample::new(f32::from_le_bytes(re) as f64, f32::from_le_bytes(im) as f64)
            }
            IqFormat::Ci16 => {
                let re = i16::from_le_bytes([bytes[0], bytes[1]]);
                let im = i16::from_le_bytes([bytes[2], bytes[3]]);
                IQSample::new(re as f64 / 32768.0, im as f64 / 32768.0)
            }
        }
    }

    /// Write one sample as little-endian bytes.
    pub fn write_sample<W: Write>(&self, writer: &mut W, sample: &IQSample) -> io::Result<()> {
        match self {
            IqFormat::Cf64 => {
                writer.write_all(&sample.re.to_le_bytes())?;
                writer.write_all(&sample.im.to_le_bytes())
            }
            IqFormat::Cf32 => {
                writer.write_all(&(sample.re as f32).to_le_bytes())?;
                writer.write_all(&(sample.im as f32).to_le_bytes())
            }
            IqFormat::Ci16 => {
                let re = (sample.re * 32767.0).round().clamp(-32768.0, 32767.0) as i16;
                let im = (sample.im * 32767.0).round().clamp(-32768.0, 32767.0) as i16;
                writer.write_all(&re.to_le_bytes())?;
                writer.write_all(&im.to_le_bytes())
            }
        }
    }

    /// Read every sample in `path`.
    pub fn read_file(&self, path: impl AsRef<Path>) -> io::Result<Vec<IQSample>> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;

        let size = self.bytes_per_sample();
        if bytes.len() % size != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("file length {} is not a multiple of {} bytes", bytes.len(), size),
            ));
        }

        Ok(bytes.chunks_exact(size).map(|chunk| self.decode(chunk)).collect())
    }

    /// Write `samples` to `path`.
    pub fn write_file(&self, path: impl AsRef<Path>, samples: &[IQSample]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        for sample in samples {
            self.write_sample(&mut writer, sample)?;
        }
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_raw_layout_is_headerless_row_major() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.bin");

        write_raw_file(&path, &[1.5f64, -2.0, 3.25]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 3 * 8);
        assert_eq!(&bytes[8..16], &(-2.0f64).to_ne_bytes());

        let back: Vec<f64> = read_raw_file(&path).unwrap();
        assert_eq!(back, vec![1.5, -2.0, 3.25]);
    }

    #[test]
    fn test_raw_complex_is_re_then_im() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iq.bin");

        write_raw_file(&path, &[IQSample::new(0.25, -0.75)]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..8], &0.25f64.to_ne_bytes());
        assert_eq!(&bytes[8..16], &(-0.75f64).to_ne_bytes());
    }

    #[test]
    fn test_raw_truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, [0u8; 12]).unwrap();

        let err = read_raw_file::<f64>(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_format_aliases() {
        assert_eq!(IqFormat::from_name("ettus"), Some(IqFormat::Cf32));
        assert_eq!(IqFormat::from_name("CF64"), Some(IqFormat::Cf64));
        assert_eq!(IqFormat::from_name("sc16"), Some(IqFormat::Ci16));
        assert_eq!(IqFormat::from_name("cu8"), None);
    }

    #[test]
    fn test_cf32_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chirp.cf32");
        let samples = vec![IQSample::new(0.5, -0.5), IQSample::new(-1.0, 0.125)];

        IqFormat::Cf32.write_file(&path, &samples).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16);

        let back = IqFormat::Cf32.read_file(&path).unwrap();
        assert_eq!(back.len(), 2);
        assert_relative_eq!(back[1].re, -1.0);
        assert_relative_eq!(back[1].im, 0.125);
    }

    #[test]
    fn test_ci16_scaling() {
        let mut bytes = Vec::new();
        IqFormat::Ci16
            .write_sample(&mut bytes, &IQSample::new(0.5, -0.5))
            .unwrap();
        let s = IqFormat::Ci16.decode(&bytes);
        assert_relative_eq!(s.re, 0.5, epsilon = 1e-4);
        assert_relative_eq!(s.im, -0.5, epsilon = 1e-4);
    }
}
