//! Image size record sent on the packet characteristic after START_DFU.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::{MAX_IMAGE_SIZE, SIZE_RECORD_LEN, SIZE_RECORD_OFFSET};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("Image of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
}

/// Size record (12 bytes)
///
/// `[00 x8][size_lo size_hi][00 00]`. The zero fields are the soft device
/// and bootloader sizes, unused for an application update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRecord {
    pub image_size: u16,
}

impl SizeRecord {
    pub const SIZE: usize = SIZE_RECORD_LEN;

    pub fn new(image_size: usize) -> Result<Self, RecordError> {
        let image_size = u16::try_from(image_size).map_err(|_| RecordError::TooLarge {
            size: image_size,
            max: MAX_IMAGE_SIZE,
        })?;
        Ok(Self { image_size })
    }

    pub fn to_bytes(&self) -> [u8; SIZE_RECORD_LEN] {
        let mut buf = [0u8; SIZE_RECORD_LEN];
        LittleEndian::write_u16(
            &mut buf[SIZE_RECORD_OFFSET..SIZE_RECORD_OFFSET + 2],
            self.image_size,
        );
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RecordError> {
        if data.len() < Self::SIZE {
            return Err(RecordError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            image_size: LittleEndian::read_u16(&data[SIZE_RECORD_OFFSET..SIZE_RECORD_OFFSET + 2]),
        })
    }
}
