//! Firmware image loading.
//!
//! Produces the flat byte sequence the upload streams. Intel HEX files are
//! flattened from their lowest to highest address with gaps filled by
//! `0xFF` (erased flash); anything else is read as a raw binary.

use std::path::Path;

use ihex::Record;
use thiserror::Error;
use tracing::{debug, info};

use crate::protocol::constants::MAX_IMAGE_SIZE;

/// Refuse HEX files whose address span would need an absurd buffer.
const MAX_HEX_SPAN: usize = 16 * 1024 * 1024;

/// Fill value for address gaps.
const GAP_FILL: u8 = 0xFF;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid Intel HEX: {0}")]
    Hex(String),
    #[error("HEX address span of {span} bytes exceeds {max}")]
    SpanTooLarge { span: usize, max: usize },
}

/// Container format of an image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    IntelHex,
    Binary,
}

impl ImageFormat {
    /// Guess the format from the file extension.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("hex") | Some("ihex") | Some("ihx") => ImageFormat::IntelHex,
            _ => ImageFormat::Binary,
        }
    }
}

/// Flat firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    /// Address of the first byte, for HEX sources.
    base_address: u32,
}

impl FirmwareImage {
    /// Wrap raw bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            base_address: 0,
        }
    }

    /// Load an image from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let image = match ImageFormat::from_path(path) {
            ImageFormat::IntelHex => Self::from_hex(&std::fs::read_to_string(path)?)?,
            ImageFormat::Binary => Self::from_bytes(std::fs::read(path)?),
        };
        info!(
            path = %path.display(),
            size = image.len(),
            base = %format!("0x{:08X}", image.base_address),
            "Loaded firmware image"
        );
        Ok(image)
    }

    /// Flatten Intel HEX text.
    pub fn from_hex(text: &str) -> Result<Self, ImageError> {
        let mut segments: Vec<(u32, Vec<u8>)> = Vec::new();
        let mut upper: u32 = 0;

        for record in ihex::Reader::new(text) {
            match record.map_err(|e| ImageError::Hex(e.to_string()))? {
                Record::Data { offset, value } => {
                    segments.push((upper.wrapping_add(offset as u32), value));
                }
                Record::ExtendedSegmentAddress(segment) => upper = (segment as u32) << 4,
                Record::ExtendedLinearAddress(high) => upper = (high as u32) << 16,
                Record::EndOfFile => break,
                Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {}
            }
        }

        let Some(start) = segments.iter().map(|(addr, _)| *addr).min() else {
            return Ok(Self::from_bytes(Vec::new()));
        };
        let end = segments
            .iter()
            .map(|(addr, bytes)| *addr as u64 + bytes.len() as u64)
            .max()
            .unwrap_or(start as u64);
        let span = (end - start as u64) as usize;
        if span > MAX_HEX_SPAN {
            return Err(ImageError::SpanTooLarge {
                span,
                max: MAX_HEX_SPAN,
            });
        }

        let mut data = vec![GAP_FILL; span];
        for (addr, bytes) in &segments {
            let at = (addr - start) as usize;
            data[at..at + bytes.len()].copy_from_slice(bytes);
        }
        debug!(
            records = segments.len(),
            start = %format!("0x{:08X}", start),
            span,
            "Flattened HEX"
        );

        Ok(Self {
            data,
            base_address: start,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    /// Check if the size fits the 16-bit size record.
    pub fn fits_size_record(&self) -> bool {
        self.data.len() <= MAX_IMAGE_SIZE
    }
}

impl AsRef<[u8]> for FirmwareImage {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // Two records at 0x1000 and 0x1008 with a 4-byte gap.
    const SAMPLE_HEX: &str = ":0410000001020304E2\n\
                              :02100800AABB81\n\
                              :00000001FF\n";

    #[test]
    fn test_from_hex_fills_gaps() {
        let image = FirmwareImage::from_hex(SAMPLE_HEX).unwrap();
        assert_eq!(image.base_address(), 0x1000);
        assert_eq!(
            image.as_bytes(),
            &[0x01, 0x02, 0x03, 0x04, 0xFF, 0xFF, 0xFF, 0xFF, 0xAA, 0xBB]
        );
    }

    #[test]
    fn test_extended_linear_address() {
        let text = ":020000040001F9\n:020000001122CB\n:00000001FF\n";
        let image = FirmwareImage::from_hex(text).unwrap();
        assert_eq!(image.base_address(), 0x0001_0000);
        assert_eq!(image.as_bytes(), &[0x11, 0x22]);
    }

    #[test]
    fn test_bad_checksum() {
        let text = ":0410000001020304E3\n:00000001FF\n";
        assert!(matches!(
            FirmwareImage::from_hex(text),
            Err(ImageError::Hex(_))
        ));
    }

    #[test]
    fn test_empty_hex() {
        let image = FirmwareImage::from_hex(":00000001FF\n").unwrap();
        assert!(image.is_empty());
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let hex_path = dir.path().join("app.hex");
        std::fs::write(&hex_path, SAMPLE_HEX).unwrap();
        assert_eq!(FirmwareImage::load(&hex_path).unwrap().len(), 10);

        let bin_path = dir.path().join("app.bin");
        let mut file = std::fs::File::create(&bin_path).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);
        let image = FirmwareImage::load(&bin_path).unwrap();
        assert_eq!(image.as_bytes(), &[1, 2, 3]);
        assert!(image.fits_size_record());
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            ImageFormat::from_path(Path::new("blinky.HEX")),
            ImageFormat::IntelHex
        );
        assert_eq!(
            ImageFormat::from_path(Path::new("blinky.bin")),
            ImageFormat::Binary
        );
        assert_eq!(ImageFormat::from_path(Path::new("blinky")), ImageFormat::Binary);
    }
}
