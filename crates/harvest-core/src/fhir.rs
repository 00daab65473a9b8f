use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// FHIR resource types that fhir-harvest knows how to acquire.
///
/// Servers can define their own resource types, so anything that looks
/// like a valid type name round-trips through `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Patient,
    Encounter,
    AllergyIntolerance,
    Condition,
    Device,
    DiagnosticReport,
    DocumentReference,
    Immunization,
    MedicationRequest,
    Observation,
    Procedure,
    ServiceRequest,
    Medication,
    Binary,
    Bundle,
    Group,
    OperationOutcome,
    #[serde(untagged)]
    Custom(String),
}

/// Patient-compartment resources, in the order we like to acquire them:
/// Patient first (it defines the cohort), Encounter next, then the rest.
pub const PATIENT_COMPARTMENT: [ResourceType; 12] = [
    ResourceType::Patient,
    ResourceType::Encounter,
    ResourceType::AllergyIntolerance,
    ResourceType::Condition,
    ResourceType::Device,
    ResourceType::DiagnosticReport,
    ResourceType::DocumentReference,
    ResourceType::Immunization,
    ResourceType::MedicationRequest,
    ResourceType::Observation,
    ResourceType::Procedure,
    ResourceType::ServiceRequest,
];

impl ResourceType {
    /// The search parameter that asks "when was this record created?",
    /// i.e. the administrative date, not the clinical one.
    ///
    /// Clinical dates make poor proxies: old vaccinations get imported
    /// from external registries, lab results land in the EHR days after
    /// their effective time. Resources without an administrative date
    /// (Patient, Device, Encounter, Immunization, Procedure) return None
    /// and are fetched without a since filter under created mode - they
    /// tend to be small, so refetching is tolerable.
    pub fn created_search_param(&self) -> Option<&'static str> {
        match self {
            Self::AllergyIntolerance => Some("date"),
            Self::Condition => Some("recorded-date"),
            Self::DiagnosticReport => Some("issued"),
            Self::DocumentReference => Some("date"),
            Self::MedicationRequest => Some("authoredon"),
            // Not searchable per the R4 spec, but some servers allow it
            // (notably Epic).
            Self::Observation => Some("issued"),
            Self::ServiceRequest => Some("authored"),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Patient => "Patient",
            Self::Encounter => "Encounter",
            Self::AllergyIntolerance => "AllergyIntolerance",
            Self::Condition => "Condition",
            Self::Device => "Device",
            Self::DiagnosticReport => "DiagnosticReport",
            Self::DocumentReference => "DocumentReference",
            Self::Immunization => "Immunization",
            Self::MedicationRequest => "MedicationRequest",
            Self::Observation => "Observation",
            Self::Procedure => "Procedure",
            Self::ServiceRequest => "ServiceRequest",
            Self::Medication => "Medication",
            Self::Binary => "Binary",
            Self::Bundle => "Bundle",
            Self::Group => "Group",
            Self::OperationOutcome => "OperationOutcome",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Patient" => Ok(Self::Patient),
            "Encounter" => Ok(Self::Encounter),
            "AllergyIntolerance" => Ok(Self::AllergyIntolerance),
            "Condition" => Ok(Self::Condition),
            "Device" => Ok(Self::Device),
            "DiagnosticReport" => Ok(Self::DiagnosticReport),
            "DocumentReference" => Ok(Self::DocumentReference),
            "Immunization" => Ok(Self::Immunization),
            "MedicationRequest" => Ok(Self::MedicationRequest),
            "Observation" => Ok(Self::Observation),
            "Procedure" => Ok(Self::Procedure),
            "ServiceRequest" => Ok(Self::ServiceRequest),
            "Medication" => Ok(Self::Medication),
            "Binary" => Ok(Self::Binary),
            "Bundle" => Ok(Self::Bundle),
            "Group" => Ok(Self::Group),
            "OperationOutcome" => Ok(Self::OperationOutcome),
            name => {
                if is_valid_resource_type_name(name) {
                    Ok(Self::Custom(name.to_string()))
                } else {
                    Err(CoreError::invalid_resource_type(name.to_string()))
                }
            }
        }
    }
}

/// Validate if a string is a valid FHIR resource type name
pub fn is_valid_resource_type_name(name: &str) -> bool {
    // FHIR resource type names start with an uppercase letter and contain
    // only letters
    !name.is_empty()
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_uppercase())
            .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_type_from_str() {
        assert_eq!(
            ResourceType::from_str("Patient").unwrap(),
            ResourceType::Patient
        );
        assert_eq!(
            ResourceType::from_str("DiagnosticReport").unwrap(),
            ResourceType::DiagnosticReport
        );
        assert_eq!(
            ResourceType::from_str("CarePlan").unwrap(),
            ResourceType::Custom("CarePlan".to_string())
        );

        assert!(ResourceType::from_str("patient").is_err());
        assert!(ResourceType::from_str("Bad123").is_err());
        assert!(ResourceType::from_str("").is_err());
    }

    #[test]
    fn test_resource_type_display_roundtrip() {
        for res_type in PATIENT_COMPARTMENT {
            let as_string = res_type.to_string();
            assert_eq!(ResourceType::from_str(&as_string).unwrap(), res_type);
        }
    }

    #[test]
    fn test_resource_type_serialization() {
        let json = serde_json::to_string(&ResourceType::Patient).unwrap();
        assert_eq!(json, "\"Patient\"");
        let json = serde_json::to_string(&ResourceType::Custom("CarePlan".into())).unwrap();
        assert_eq!(json, "\"CarePlan\"");
    }

    #[test]
    fn test_resource_type_deserialization() {
        let res_type: ResourceType = serde_json::from_str("\"Observation\"").unwrap();
        assert_eq!(res_type, ResourceType::Observation);
    }

    #[test]
    fn test_created_search_params() {
        assert_eq!(
            ResourceType::Condition.created_search_param(),
            Some("recorded-date")
        );
        assert_eq!(
            ResourceType::MedicationRequest.created_search_param(),
            Some("authoredon")
        );
        // No administrative date to search on
        assert_eq!(ResourceType::Patient.created_search_param(), None);
        assert_eq!(ResourceType::Device.created_search_param(), None);
        assert_eq!(ResourceType::Encounter.created_search_param(), None);
    }

    #[test]
    fn test_patient_compartment_starts_with_patient() {
        assert_eq!(PATIENT_COMPARTMENT[0], ResourceType::Patient);
        assert_eq!(PATIENT_COMPARTMENT[1], ResourceType::Encounter);
    }

    #[test]
    fn test_is_valid_resource_type_name() {
        assert!(is_valid_resource_type_name("Patient"));
        assert!(is_valid_resource_type_name("A"));
        assert!(!is_valid_resource_type_name("patient"));
        assert!(!is_valid_resource_type_name("Patient123"));
        assert!(!is_valid_resource_type_name(""));
    }
}
