pub mod export;
pub mod hydrate;
pub mod single;

use harvest_client::{ClientConfig, FhirClient};
use harvest_core::fhir::PATIENT_COMPARTMENT;
use harvest_engine::{EngineError, Result};

use crate::cli::AuthArgs;

/// Build the one client this run will use.
pub(crate) async fn make_client(auth: &AuthArgs) -> Result<FhirClient> {
    let fhir_url = auth
        .fhir_url
        .clone()
        .ok_or_else(|| EngineError::configuration("--fhir-url is required"))?;

    let mut config = ClientConfig::new(fhir_url);
    config.smart_client_id = auth.smart_client_id.clone();
    config.smart_key = auth.smart_key.clone();
    config.token_url = auth.token_url.clone();
    if let Some(path) = &auth.bearer_token_file {
        let token = std::fs::read_to_string(path).map_err(|err| {
            EngineError::configuration(format!("cannot read {}: {err}", path.display()))
        })?;
        config.bearer_token = Some(token.trim().to_string());
    }

    let mut scope_types: Vec<String> = PATIENT_COMPARTMENT
        .iter()
        .map(|res_type| res_type.to_string())
        .collect();
    scope_types.push("Medication".to_string());
    scope_types.push("Binary".to_string());
    config.scope_types = scope_types;

    Ok(FhirClient::new(config).await?)
}
