//! Walking paged Bundle search results.

use reqwest::Method;
use serde_json::Value;

use crate::client::{ensure_success, FhirClient};
use crate::error::Result;

/// A lazy cursor over a chain of search result Bundles.
///
/// The cursor is just the next-link URL, so a consumer can persist it and
/// resume later with [`BundlePages::resume`].
pub struct BundlePages<'a> {
    client: &'a FhirClient,
    next: Option<String>,
}

impl<'a> BundlePages<'a> {
    pub fn new(client: &'a FhirClient, first_url: impl Into<String>) -> Self {
        Self {
            client,
            next: Some(first_url.into()),
        }
    }

    /// Continue from a previously saved cursor (None means exhausted).
    pub fn resume(client: &'a FhirClient, cursor: Option<String>) -> Self {
        Self {
            client,
            next: cursor,
        }
    }

    /// The URL the next call would fetch.
    pub fn cursor(&self) -> Option<&str> {
        self.next.as_deref()
    }

    /// Fetch the next Bundle, or None once the chain is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Value>> {
        let Some(url) = self.next.take() else {
            return Ok(None);
        };

        // Hand-encode plus signs: the HTTP spec turns them into spaces in
        // query strings, which mangles timestamp offsets like +14:00.
        let url = url.replace('+', "%2B");

        let response = self.client.request(Method::GET, &url).await?;
        let response = ensure_success(response).await?;
        let bundle: Value = response.json().await?;

        if bundle.get("resourceType").and_then(Value::as_str) == Some("Bundle") {
            self.next = next_link(&bundle);
            Ok(Some(bundle))
        } else {
            // Not a Bundle; surface it as a single terminal page so the
            // caller sees whatever the server actually said.
            self.next = None;
            Ok(Some(bundle))
        }
    }
}

/// The `link[rel=next]` URL of a Bundle, if any.
pub fn next_link(bundle: &Value) -> Option<String> {
    bundle
        .get("link")
        .and_then(Value::as_array)?
        .iter()
        .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))
        .and_then(|link| link.get("url"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// The entry resources of a Bundle.
pub fn entry_resources(bundle: &Value) -> Vec<&Value> {
    bundle
        .get("entry")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("resource"))
                .collect()
        })
        .unwrap_or_default()
}
