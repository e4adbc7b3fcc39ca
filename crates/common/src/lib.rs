//! Common types shared by the storefront auth crates and CLI

mod error;
mod resolve;
mod secret;

pub use error::{Error, Result};
pub use resolve::{resolve_config_path, resolve_secret};
pub use secret::Secret;
