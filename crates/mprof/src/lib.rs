pub mod cli;
pub mod commands;
pub mod error;
pub mod storage;
pub mod symbols;

pub use error::{Error, Result};
