//! Type selection, `_typeFilter` handling, and since-date semantics.
//!
//! A [`Filters`] value carries the whole slicing-and-dicing configuration
//! of one export: which resource types, which extra search filters, and
//! how the `--since` lower bound is applied per type.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use harvest_client::capabilities;
use harvest_core::{FhirDateTime, ResourceType};

use crate::error::{EngineError, Result};

/// The nine standard US Core Observation categories. Observation volume
/// gets overwhelming quickly, so crawls default to these unless
/// `--no-default-filters` is set.
pub const OBSERVATION_CATEGORIES: &str = "category=social-history,vital-signs,imaging,laboratory,survey,exam,procedure,therapy,activity";

/// How `--since` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinceMode {
    /// Use the server's update time (`_lastUpdated` / bulk `_since`).
    Updated,
    /// Use per-type administrative creation dates, for servers that do
    /// not index `meta.lastUpdated`.
    Created,
}

impl std::fmt::Display for SinceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Updated => write!(f, "updated"),
            Self::Created => write!(f, "created"),
        }
    }
}

impl std::str::FromStr for SinceMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "updated" => Ok(Self::Updated),
            "created" => Ok(Self::Created),
            other => Err(format!("unknown since mode: {other}")),
        }
    }
}

/// The user-facing `--since-mode` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinceModeArg {
    /// Pick from the server's capabilities.
    #[default]
    Auto,
    Updated,
    Created,
}

/// Per-type search configuration for one export.
#[derive(Debug, Clone)]
pub struct Filters {
    types: Vec<ResourceType>,
    filters: BTreeMap<String, BTreeSet<String>>,
    since: Option<String>,
    since_mode: Option<SinceMode>,
    /// Created-mode search fields actually supported by the server.
    since_fields: BTreeMap<String, String>,
    /// Per-type since values resolved from `--since=auto`. A type mapped
    /// to None gets no since filter (full fetch).
    detailed_since: Option<BTreeMap<String, Option<FhirDateTime>>>,
}

impl Filters {
    /// Build filters from CLI-shaped arguments.
    ///
    /// `since` must be a concrete timestamp here; `--since=auto` is
    /// resolved by the caller into [`Filters::set_detailed_since`].
    pub fn new(
        types: Vec<ResourceType>,
        type_filter_args: &[String],
        since: Option<String>,
        since_mode: SinceModeArg,
        use_default_filters: bool,
        caps: Option<&Value>,
    ) -> Result<Self> {
        let mut filters: BTreeMap<String, BTreeSet<String>> = types
            .iter()
            .map(|res_type| (res_type.to_string(), BTreeSet::new()))
            .collect();

        for arg in type_filter_args {
            let Some((res_type, params)) = arg.split_once('?') else {
                return Err(EngineError::configuration(format!(
                    "type filter '{arg}' must be in the format 'Resource?params'"
                )));
            };
            match filters.get_mut(res_type) {
                Some(entries) => {
                    entries.insert(params.to_string());
                }
                None => {
                    return Err(EngineError::configuration(format!(
                        "type filter for {res_type} but that type is not included in --type"
                    )));
                }
            }
        }

        if use_default_filters {
            if let Some(obs) = filters.get_mut("Observation") {
                if obs.is_empty() {
                    obs.insert(OBSERVATION_CATEGORIES.to_string());
                }
            }
        }

        let resolved_mode = if since.is_some() {
            Some(resolve_since_mode(since_mode, caps))
        } else {
            None
        };

        let mut since_fields = BTreeMap::new();
        if resolved_mode == Some(SinceMode::Created) {
            for res_type in &types {
                if let Some(field) = res_type.created_search_param() {
                    let supported = match caps {
                        Some(caps) => {
                            capabilities::supports_search_param(caps, &res_type.to_string(), field)
                        }
                        // Without a capability statement we trust the
                        // R4 registry.
                        None => true,
                    };
                    if supported {
                        since_fields.insert(res_type.to_string(), field.to_string());
                    }
                }
            }
        }

        Ok(Self {
            types,
            filters,
            since,
            since_mode: resolved_mode,
            since_fields,
            detailed_since: None,
        })
    }

    pub fn types(&self) -> &[ResourceType] {
        &self.types
    }

    pub fn type_names(&self) -> Vec<String> {
        self.types.iter().map(|t| t.to_string()).collect()
    }

    pub fn since(&self) -> Option<&str> {
        self.since.as_deref()
    }

    pub fn since_mode(&self) -> Option<SinceMode> {
        self.since_mode
    }

    /// Drop types the server does not support.
    pub fn retain_types(&mut self, supported: &BTreeSet<String>) -> Vec<ResourceType> {
        let (kept, skipped): (Vec<_>, Vec<_>) = std::mem::take(&mut self.types)
            .into_iter()
            .partition(|res_type| supported.contains(&res_type.to_string()));
        for res_type in &skipped {
            self.filters.remove(&res_type.to_string());
        }
        self.types = kept;
        skipped
    }

    /// Install per-type since values resolved from `--since=auto`.
    pub fn set_detailed_since(&mut self, values: BTreeMap<String, Option<FhirDateTime>>) {
        self.detailed_since = Some(values);
    }

    /// The since timestamp to use for one resource type, if any.
    fn since_value_for(&self, res_type: &str) -> Option<String> {
        match &self.detailed_since {
            Some(detailed) => detailed
                .get(res_type)
                .and_then(|value| value.as_ref())
                .map(|dt| dt.to_string()),
            None => self
                .since
                .as_ref()
                .filter(|value| value.as_str() != "auto")
                .cloned(),
        }
    }

    /// The date search parameter for a type, under the resolved mode.
    fn since_param_for(&self, res_type: &str) -> Option<String> {
        let value = self.since_value_for(res_type)?;
        match self.since_mode? {
            SinceMode::Updated => Some(format!("_lastUpdated=gt{value}")),
            SinceMode::Created => self
                .since_fields
                .get(res_type)
                .map(|field| format!("{field}=gt{value}")),
        }
    }

    /// Search filter variants for one type during a crawl.
    ///
    /// Multiple type filters are OR semantics, so each becomes its own
    /// query whose results are unioned. The returned strings are query
    /// fragments to append after `Type?patient=P`; an empty string means
    /// an unfiltered query.
    pub fn search_variants(&self, res_type: &str, with_since: bool) -> Vec<String> {
        let base: Vec<String> = match self.filters.get(res_type) {
            Some(entries) if !entries.is_empty() => entries.iter().cloned().collect(),
            _ => vec![String::new()],
        };

        if !with_since {
            return base;
        }
        let Some(since_param) = self.since_param_for(res_type) else {
            return base;
        };

        base.into_iter()
            .map(|variant| {
                if variant.is_empty() {
                    since_param.clone()
                } else {
                    format!("{variant}&{since_param}")
                }
            })
            .collect()
    }

    /// `_typeFilter` values for a bulk export kickoff.
    ///
    /// Under updated mode the bulk `_since` parameter carries the date
    /// (it has extra server-side logic for patients added to a group
    /// after the date), so only created mode folds dates into filters.
    pub fn bulk_type_filters(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut result = self.filters.clone();
        if self.since_mode == Some(SinceMode::Created) {
            for (res_type, entries) in result.iter_mut() {
                let Some(param) = self.since_param_for(res_type) else {
                    continue;
                };
                if entries.is_empty() {
                    entries.insert(param);
                } else {
                    *entries = entries
                        .iter()
                        .map(|entry| format!("{entry}&{param}"))
                        .collect();
                }
            }
        }
        result
    }

    /// Coalesce the per-type since values down to one bulk `_since`.
    pub fn bulk_since(&self) -> Option<String> {
        if self.since_mode == Some(SinceMode::Created) {
            return None;
        }
        match &self.detailed_since {
            Some(detailed) => {
                // If any type has no previous timestamp, a shared _since
                // would wrongly limit its first fetch.
                if detailed.values().any(|value| value.is_none()) {
                    None
                } else {
                    detailed
                        .values()
                        .flatten()
                        .min()
                        .map(|dt| dt.to_string())
                }
            }
            None => self
                .since
                .as_ref()
                .filter(|value| value.as_str() != "auto")
                .cloned(),
        }
    }

    /// A copy of these filters restricted to one resource type, e.g. the
    /// Patient-only bulk export used for Group membership discovery.
    pub fn restricted_to(&self, res_type: &ResourceType) -> Filters {
        let name = res_type.to_string();
        let mut restricted = self.clone();
        restricted.types.retain(|t| t == res_type);
        restricted.filters.retain(|key, _| *key == name);
        restricted.since_fields.retain(|key, _| *key == name);
        if let Some(detailed) = &mut restricted.detailed_since {
            detailed.retain(|key, _| *key == name);
        }
        restricted
    }

    /// `Type?filter` strings for `metadata.json`, defaults included.
    pub fn filter_descriptions(&self) -> Vec<String> {
        let mut descriptions = Vec::new();
        for (res_type, entries) in &self.filters {
            for entry in entries {
                descriptions.push(format!("{res_type}?{entry}"));
            }
        }
        descriptions
    }
}

fn resolve_since_mode(arg: SinceModeArg, caps: Option<&Value>) -> SinceMode {
    match arg {
        SinceModeArg::Updated => SinceMode::Updated,
        SinceModeArg::Created => SinceMode::Created,
        SinceModeArg::Auto => {
            // Check Patient?_lastUpdated as a proxy for the whole server.
            let updated_ok = caps
                .map(|caps| capabilities::supports_search_param(caps, "Patient", "_lastUpdated"))
                .unwrap_or(true);
            if updated_ok {
                SinceMode::Updated
            } else {
                tracing::info!(
                    "Server does not support the 'updated' since mode, using 'created' instead"
                );
                SinceMode::Created
            }
        }
    }
}
