//! Core FHIR data model shared by all fhir-harvest crates.

pub mod error;
pub mod fhir;
pub mod reference;
pub mod resource;
pub mod time;

pub use error::{CoreError, Result};
pub use fhir::ResourceType;
pub use reference::{parse_reference, FhirReference, UnresolvableReference};
pub use resource::ResourceKey;
pub use time::FhirDateTime;
