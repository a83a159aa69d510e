pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod protocol;
pub mod state;
pub mod transport;

pub use error::{Error, ErrorKind, Result};
