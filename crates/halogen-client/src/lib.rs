//! Client side of the halogen socket gateway.

pub mod client;
pub mod config;
pub mod error;
pub mod interface;

pub use client::HalogenClient;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use interface::HalogenInterface;
