//! Protocol module - legacy DFU wire definitions.

pub mod constants;
pub mod opcode;
pub mod record;

pub use constants::*;
pub use opcode::{DfuOpcode, hex_string};
pub use record::{RecordError, SizeRecord};
