pub mod adapter;
pub mod dap;
pub mod debuggee;
pub mod error;
pub mod log;

pub use error::Error;
