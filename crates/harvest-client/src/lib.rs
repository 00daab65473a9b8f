//! Authenticated FHIR REST client.
//!
//! One [`FhirClient`] is created per run and passed by reference to every
//! component that talks to the server. It owns the connection pool, the
//! retry policy, and the SMART backend-services token state.

pub mod auth;
pub mod capabilities;
pub mod client;
pub mod error;
pub mod paging;
pub mod retry;

pub use client::{ensure_success, ClientConfig, FhirClient, RequestOptions};
pub use error::{ClientError, Result};
pub use paging::BundlePages;
pub use retry::RetryPolicy;
