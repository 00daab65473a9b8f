//! Optional TOML configuration, merged under the command line (flags
//! win).

use std::path::{Path, PathBuf};

use serde::Deserialize;

use harvest_engine::EngineError;

use crate::cli::AuthArgs;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct FileConfig {
    pub fhir_url: Option<String>,
    pub smart_client_id: Option<String>,
    pub smart_key: Option<PathBuf>,
    pub token_url: Option<String>,
    pub bearer_token_file: Option<PathBuf>,
    pub group: Option<String>,
    pub id_system: Option<String>,
    pub mimetypes: Option<String>,
    pub nickname: Option<String>,
}

pub fn load(path: Option<&Path>) -> Result<FileConfig, EngineError> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let contents = std::fs::read_to_string(path).map_err(|err| {
        EngineError::configuration(format!("cannot read config {}: {err}", path.display()))
    })?;
    toml::from_str(&contents).map_err(|err| {
        EngineError::configuration(format!("bad config {}: {err}", path.display()))
    })
}

/// Fill in auth settings the command line left unset.
pub fn apply_auth(auth: &mut AuthArgs, config: &FileConfig) {
    if auth.fhir_url.is_none() {
        auth.fhir_url = config.fhir_url.clone();
    }
    if auth.smart_client_id.is_none() {
        auth.smart_client_id = config.smart_client_id.clone();
    }
    if auth.smart_key.is_none() {
        auth.smart_key = config.smart_key.clone();
    }
    if auth.token_url.is_none() {
        auth.token_url = config.token_url.clone();
    }
    if auth.bearer_token_file.is_none() {
        auth.bearer_token_file = config.bearer_token_file.clone();
    }
}
