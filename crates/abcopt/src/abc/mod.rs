//! The ABC binary container: scalar codec, instruction set and file reader.

pub mod constants;
pub mod opcodes;
pub mod parse;
pub mod reader;
pub mod writer;

pub use opcodes::Op;
pub use parse::{read_abc, AbcFile, ConstantPools};
pub use reader::Reader;
pub use writer::Writer;
