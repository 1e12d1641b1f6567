//! Message dispatch: sizing, chunking, and reply assembly.

pub mod assembler;
pub mod chunker;
pub mod size;

pub use assembler::{ChatExchange, ReplyAssembler};
