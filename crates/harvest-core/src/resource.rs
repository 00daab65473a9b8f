//! Helpers for working with raw FHIR resources.
//!
//! Exported resources pass through fhir-harvest untouched, so we keep them
//! as `serde_json::Value` maps rather than deserializing into typed
//! structs. These helpers cover the handful of fields the engine needs.

use serde_json::Value;
use std::fmt;

/// The identity of a resource: `(resourceType, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub resource_type: String,
    pub id: String,
}

impl ResourceKey {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Extract the identity of a resource, if it has one.
    pub fn of(resource: &Value) -> Option<Self> {
        Some(Self::new(resource_type(resource)?, resource_id(resource)?))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// The `resourceType` field, if present and a string.
pub fn resource_type(resource: &Value) -> Option<&str> {
    resource.get("resourceType").and_then(Value::as_str)
}

/// The `id` field, if present and a string.
pub fn resource_id(resource: &Value) -> Option<&str> {
    resource.get("id").and_then(Value::as_str)
}

/// The server's update time: `meta.lastUpdated`.
pub fn updated_date(resource: &Value) -> Option<&str> {
    resource
        .get("meta")
        .and_then(|meta| meta.get("lastUpdated"))
        .and_then(Value::as_str)
}

/// The administrative creation date, per resource type.
///
/// Mirror of [`crate::fhir::ResourceType::created_search_param`] - if you
/// change one, change the other.
pub fn created_date(resource: &Value) -> Option<&str> {
    let field = match resource_type(resource)? {
        "AllergyIntolerance" => "recordedDate",
        "Condition" => "recordedDate",
        "DiagnosticReport" => "issued",
        "DocumentReference" => "date",
        // Not searchable yet, but grab it for the future
        "Immunization" => "recorded",
        "MedicationRequest" => "authoredOn",
        "Observation" => "issued",
        "ServiceRequest" => "authoredOn",
        _ => return None,
    };
    resource.get(field).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_key_of() {
        let resource = json!({"resourceType": "Patient", "id": "p1"});
        let key = ResourceKey::of(&resource).unwrap();
        assert_eq!(key, ResourceKey::new("Patient", "p1"));
        assert_eq!(key.to_string(), "Patient/p1");
    }

    #[test]
    fn test_resource_key_of_missing_fields() {
        assert!(ResourceKey::of(&json!({"resourceType": "Patient"})).is_none());
        assert!(ResourceKey::of(&json!({"id": "p1"})).is_none());
        assert!(ResourceKey::of(&json!("nope")).is_none());
    }

    #[test]
    fn test_updated_date() {
        let resource = json!({
            "resourceType": "Condition",
            "id": "c1",
            "meta": {"lastUpdated": "2024-01-02T03:04:05Z"},
        });
        assert_eq!(updated_date(&resource), Some("2024-01-02T03:04:05Z"));
        assert_eq!(updated_date(&json!({"resourceType": "Condition"})), None);
    }

    #[test]
    fn test_created_date_per_type() {
        let condition = json!({
            "resourceType": "Condition",
            "id": "c1",
            "recordedDate": "2021-06-07",
        });
        assert_eq!(created_date(&condition), Some("2021-06-07"));

        let med_req = json!({
            "resourceType": "MedicationRequest",
            "id": "m1",
            "authoredOn": "2022-02-02T00:00:00Z",
        });
        assert_eq!(created_date(&med_req), Some("2022-02-02T00:00:00Z"));

        // Patient has no administrative date
        let patient = json!({"resourceType": "Patient", "id": "p1"});
        assert_eq!(created_date(&patient), None);
    }
}
