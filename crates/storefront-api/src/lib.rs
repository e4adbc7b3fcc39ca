//! Authorized storefront API calls on top of `storefront-auth`
//!
//! `ApiClient` is the only place credentials meet requests: it obtains a
//! valid credential, sets the `Authorization` header, and routes every
//! response through the manager's rejection classification.

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::{ApiError, Result};
