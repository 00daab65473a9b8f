//! FHIR Reference parsing.
//!
//! References come in several shapes:
//! - Relative: `Patient/123`
//! - Versioned: `Patient/123/_history/1`
//! - Absolute URL: `http://example.org/fhir/Patient/123`
//! - Contained: `#contained-id` (cannot be resolved externally)
//! - URN: `urn:uuid:xxx` or `urn:oid:xxx` (cannot be resolved externally)

use crate::fhir::is_valid_resource_type_name;
use std::fmt;

/// A successfully parsed FHIR reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FhirReference {
    /// The resource type (e.g., "Patient", "Observation")
    pub resource_type: String,
    /// The resource ID
    pub id: String,
    /// Optional version ID from a `_history` suffix
    pub version: Option<String>,
}

impl FhirReference {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version: None,
        }
    }

    /// Returns the reference as a relative string (Type/id).
    pub fn to_relative(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

impl fmt::Display for FhirReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_relative())
    }
}

/// A reference that cannot be resolved against the server we export from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvableReference {
    /// A contained reference (starts with `#`)
    Contained(String),
    /// A URN reference (`urn:uuid:xxx` or `urn:oid:xxx`)
    Urn(String),
    /// A reference into a different server
    External(String),
    /// A malformed reference
    Invalid(String),
}

impl fmt::Display for UnresolvableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contained(id) => write!(f, "contained reference: #{id}"),
            Self::Urn(urn) => write!(f, "URN reference: {urn}"),
            Self::External(url) => write!(f, "external reference: {url}"),
            Self::Invalid(reason) => write!(f, "invalid reference: {reason}"),
        }
    }
}

impl std::error::Error for UnresolvableReference {}

/// Parse a FHIR reference string into its components.
///
/// When `base_url` is given, absolute references are only accepted if they
/// live under that base; otherwise they are reported as `External`.
pub fn parse_reference(
    reference: &str,
    base_url: Option<&str>,
) -> Result<FhirReference, UnresolvableReference> {
    if reference.is_empty() {
        return Err(UnresolvableReference::Invalid("empty reference".into()));
    }
    if let Some(id) = reference.strip_prefix('#') {
        return Err(UnresolvableReference::Contained(id.to_string()));
    }
    if reference.starts_with("urn:") {
        return Err(UnresolvableReference::Urn(reference.to_string()));
    }

    let relative: &str = if reference.starts_with("http://") || reference.starts_with("https://") {
        match base_url {
            Some(base) => {
                let base = base.trim_end_matches('/');
                match reference.strip_prefix(base) {
                    Some(rest) => rest.trim_start_matches('/'),
                    None => return Err(UnresolvableReference::External(reference.to_string())),
                }
            }
            // Without a base to compare against, take the tail segments
            // on faith if they look like Type/id.
            None => tail_segments(reference)
                .ok_or_else(|| UnresolvableReference::External(reference.to_string()))?,
        }
    } else {
        reference
    };

    let segments: Vec<&str> = relative.split('/').collect();
    match segments.as_slice() {
        [res_type, id] if is_valid_resource_type_name(res_type) && !id.is_empty() => {
            Ok(FhirReference::new(*res_type, *id))
        }
        [res_type, id, "_history", version]
            if is_valid_resource_type_name(res_type) && !id.is_empty() && !version.is_empty() =>
        {
            Ok(FhirReference {
                resource_type: res_type.to_string(),
                id: id.to_string(),
                version: Some(version.to_string()),
            })
        }
        _ => Err(UnresolvableReference::Invalid(reference.to_string())),
    }
}

/// For an absolute URL without a known base, find the trailing `Type/id`
/// (or `Type/id/_history/vid`) portion.
fn tail_segments(reference: &str) -> Option<&str> {
    let trimmed = reference.trim_end_matches('/');
    let segments: Vec<&str> = trimmed.split('/').collect();
    let n = segments.len();

    let type_index = if n >= 4 && segments[n - 2] == "_history" {
        n - 4
    } else if n >= 2 {
        n - 2
    } else {
        return None;
    };

    if !is_valid_resource_type_name(segments[type_index]) {
        return None;
    }

    // Byte offset of the type segment within the original string.
    let skipped: usize = segments[..type_index].iter().map(|s| s.len() + 1).sum();
    Some(&trimmed[skipped..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relative() {
        let parsed = parse_reference("Patient/123", None).unwrap();
        assert_eq!(parsed.resource_type, "Patient");
        assert_eq!(parsed.id, "123");
        assert_eq!(parsed.version, None);
    }

    #[test]
    fn test_parse_versioned() {
        let parsed = parse_reference("Patient/123/_history/2", None).unwrap();
        assert_eq!(parsed.version, Some("2".to_string()));
        assert_eq!(parsed.to_relative(), "Patient/123");
    }

    #[test]
    fn test_parse_absolute_with_base() {
        let parsed = parse_reference(
            "https://ehr.example.com/fhir/Observation/o9",
            Some("https://ehr.example.com/fhir"),
        )
        .unwrap();
        assert_eq!(parsed.resource_type, "Observation");
        assert_eq!(parsed.id, "o9");
    }

    #[test]
    fn test_parse_absolute_wrong_base() {
        let result = parse_reference(
            "https://other.example.com/fhir/Observation/o9",
            Some("https://ehr.example.com/fhir"),
        );
        assert!(matches!(result, Err(UnresolvableReference::External(_))));
    }

    #[test]
    fn test_parse_absolute_without_base() {
        let parsed = parse_reference("https://ehr.example.com/fhir/Medication/m1", None).unwrap();
        assert_eq!(parsed.resource_type, "Medication");
        assert_eq!(parsed.id, "m1");
    }

    #[test]
    fn test_parse_contained() {
        let result = parse_reference("#med1", None);
        assert_eq!(result, Err(UnresolvableReference::Contained("med1".into())));
    }

    #[test]
    fn test_parse_urn() {
        let result = parse_reference("urn:uuid:1234", None);
        assert!(matches!(result, Err(UnresolvableReference::Urn(_))));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            parse_reference("", None),
            Err(UnresolvableReference::Invalid(_))
        ));
        assert!(matches!(
            parse_reference("lowercase/123", None),
            Err(UnresolvableReference::Invalid(_))
        ));
        assert!(matches!(
            parse_reference("Patient", None),
            Err(UnresolvableReference::Invalid(_))
        ));
    }
}
