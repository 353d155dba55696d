pub mod client;
pub mod config;
pub mod error;
pub mod master;
pub mod protocol;
pub mod worker;

pub use error::{DroverError, Result};
