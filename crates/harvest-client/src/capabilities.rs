//! Queries against a server's CapabilityStatement.
//!
//! See <https://www.hl7.org/fhir/R4/capabilitystatement.html>.

use serde_json::Value;
use std::collections::BTreeSet;

/// The `rest` entry with `mode == "server"`, if any.
fn server_rest(capabilities: &Value) -> Option<&Value> {
    capabilities
        .get("rest")
        .and_then(Value::as_array)?
        .iter()
        .find(|rest| rest.get("mode").and_then(Value::as_str) == Some("server"))
}

/// The resource types the server declares support for, or None when the
/// statement has no server-mode rest section to consult.
pub fn server_resource_types(capabilities: &Value) -> Option<BTreeSet<String>> {
    let resources = server_rest(capabilities)?.get("resource")?.as_array()?;
    Some(
        resources
            .iter()
            .filter_map(|resource| resource.get("type").and_then(Value::as_str))
            .map(str::to_string)
            .collect(),
    )
}

/// Whether the server advertises a search parameter for a resource type.
pub fn supports_search_param(capabilities: &Value, res_type: &str, param: &str) -> bool {
    let Some(rest) = server_rest(capabilities) else {
        return false;
    };
    let Some(resources) = rest.get("resource").and_then(Value::as_array) else {
        return false;
    };
    let Some(resource) = resources
        .iter()
        .find(|resource| resource.get("type").and_then(Value::as_str) == Some(res_type))
    else {
        return false;
    };
    resource
        .get("searchParam")
        .and_then(Value::as_array)
        .map(|params| {
            params
                .iter()
                .any(|p| p.get("name").and_then(Value::as_str) == Some(param))
        })
        .unwrap_or(false)
}

/// `(name, version, releaseDate)` of the server software, for log events.
pub fn software_info(capabilities: &Value) -> (Option<&str>, Option<&str>, Option<&str>) {
    let software = capabilities.get("software");
    let field = |name: &str| {
        software
            .and_then(|s| s.get(name))
            .and_then(Value::as_str)
    };
    (field("name"), field("version"), field("releaseDate"))
}
