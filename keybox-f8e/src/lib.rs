//! Remote authority (f8e) boundary
//!
//! Service traits for privileged actions and keysets, the JSON/HTTPS client
//! that implements them, and an in-memory authority for tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod service;

#[cfg(any(test, feature = "test-helpers"))]
pub mod fake;

pub use client::F8eClient;
pub use config::F8eConfig;
pub use error::{error_from_response, ErrorCode};
pub use service::{CreateKeysetRequest, KeysetService, PrivilegedActionService, RemoteKeyset};

#[cfg(any(test, feature = "test-helpers"))]
pub use fake::FakeF8e;
