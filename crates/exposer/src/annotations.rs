//! Metadata written onto exposed services and the minimal patch used to persist it.
//!
//! Every strategy computes the external URL of a service and records it with
//! [`add_exposure_annotation`]. The record is then turned into a JSON patch
//! with [`service_patch`], which yields `None` when nothing changed so that no
//! write reaches the API server.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;
use serde_json::Value;

/// Label marking a service for exposure.
pub const EXPOSE_LABEL: (&str, &str) = ("expose", "true");
/// Annotation marking a service for exposure.
pub const EXPOSE_ANNOTATION: (&str, &str) = ("fabric8.io/expose", "true");
/// Annotation marking a service for injection, which also requests exposure.
pub const INJECT_ANNOTATION: (&str, &str) = ("fabric8.io/inject", "true");

/// Annotation holding the computed external URL.
pub const EXPOSE_URL_ANNOTATION: &str = "fabric8.io/exposeUrl";
/// Annotation whose value names a second annotation mirroring the host name.
pub const EXPOSE_HOST_NAME_AS_ANNOTATION: &str = "fabric8.io/exposeHostNameAs";
/// Annotation selecting which declared service port gets exposed.
pub const EXPOSE_PORT_ANNOTATION: &str = "fabric8.io/exposePort";
/// Annotation overriding the path part of the external URL.
pub const API_SERVICE_PATH_ANNOTATION: &str = "api.service.kubernetes.io/path";

/// Returns true when the service carries any of the exposure markers.
pub fn is_exposed(svc: &Service) -> bool {
    has_entry(svc.metadata.labels.as_ref(), EXPOSE_LABEL)
        || has_entry(svc.metadata.annotations.as_ref(), EXPOSE_ANNOTATION)
        || has_entry(svc.metadata.annotations.as_ref(), INJECT_ANNOTATION)
}

fn has_entry(map: Option<&BTreeMap<String, String>>, (key, value): (&str, &str)) -> bool {
    map.and_then(|m| m.get(key)).map(String::as_str) == Some(value)
}

/// The `namespace/name` key identifying a service.
pub fn service_key(svc: &Service) -> String {
    format!(
        "{}/{}",
        svc.metadata.namespace.as_deref().unwrap_or_default(),
        svc.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Looks up a single annotation on the service, treating empty values as unset.
pub fn annotation<'a>(svc: &'a Service, key: &str) -> Option<&'a str> {
    svc.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Looks up a single label on the service, treating empty values as unset.
pub fn label<'a>(svc: &'a Service, key: &str) -> Option<&'a str> {
    svc.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Picks the URL scheme for a host that is not known to be served over TLS.
///
/// A host carrying port 443 or 8443, or a service declaring a port named
/// `https`, is assumed to speak https.
pub fn find_http_protocol(svc: &Service, host: &str) -> &'static str {
    let tls_port = host
        .rsplit_once(':')
        .map(|(_, port)| port == "443" || port == "8443")
        .unwrap_or(false);
    let https_port = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| ports.iter().any(|p| p.name.as_deref() == Some("https")))
        .unwrap_or(false);
    if tls_port || https_port {
        "https"
    } else {
        "http"
    }
}

/// Records the external URL of the service.
///
/// The path is replaced by the service's own path override when one is set.
/// When `tls` is false the scheme is guessed with [`find_http_protocol`].
pub fn add_exposure_annotation(svc: &mut Service, host: &str, path: &str, tls: bool) {
    let protocol = if tls {
        "https"
    } else {
        find_http_protocol(svc, host)
    };
    let path = annotation(svc, API_SERVICE_PATH_ANNOTATION)
        .map(str::to_owned)
        .unwrap_or_else(|| path.to_owned());
    let url = url_join(&format!("{}://{}", protocol, host), &path);

    let annotations = svc.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(EXPOSE_URL_ANNOTATION.to_owned(), url);
    if let Some(alias) = annotations
        .get(EXPOSE_HOST_NAME_AS_ANNOTATION)
        .filter(|k| !k.is_empty())
        .cloned()
    {
        annotations.insert(alias, host.to_owned());
    }
}

/// Marks the service as exposed with an address that is not known yet.
pub fn set_pending_exposure(svc: &mut Service) {
    svc.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(EXPOSE_URL_ANNOTATION.to_owned(), String::new());
}

/// Removes the URL annotation and its host name mirror.
///
/// Returns false when neither was present.
pub fn remove_exposure_annotation(svc: &mut Service) -> bool {
    let annotations = match svc.metadata.annotations.as_mut() {
        Some(a) => a,
        None => return false,
    };
    let mut removed = annotations.remove(EXPOSE_URL_ANNOTATION).is_some();
    if let Some(alias) = annotations
        .get(EXPOSE_HOST_NAME_AS_ANNOTATION)
        .filter(|k| !k.is_empty())
        .cloned()
    {
        removed |= annotations.remove(&alias).is_some();
    }
    removed
}

/// Joins a URL and a path with exactly one slash between them.
///
/// An empty path leaves the URL untouched.
pub fn url_join(url: &str, path: &str) -> String {
    if path.is_empty() {
        return url.to_owned();
    }
    format!(
        "{}/{}",
        url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Joins path segments so that exactly one `/` separates each of them.
///
/// Leading slashes of the first segment and trailing slashes of the last one
/// are preserved.
pub fn join_paths(segments: &[&str]) -> String {
    let last = segments.len().saturating_sub(1);
    let mut joined = String::new();
    for (i, segment) in segments.iter().enumerate() {
        let mut s = *segment;
        if i > 0 {
            joined.push('/');
            s = s.trim_start_matches('/');
        }
        if i < last {
            s = s.trim_end_matches('/');
        }
        joined.push_str(s);
    }
    joined
}

/// Computes a JSON patch turning `original` into `modified`.
///
/// Absent fields, `null` and empty maps are treated as equal, so that a
/// service without annotations and one with an empty annotation map produce
/// no patch. Returns `None` when there is nothing to write.
pub fn service_patch(
    original: &Service,
    modified: &Service,
) -> anyhow::Result<Option<json_patch::Patch>> {
    let mut original = serde_json::to_value(original)?;
    let mut modified = serde_json::to_value(modified)?;
    prune_blank(&mut original);
    prune_blank(&mut modified);
    let patch = json_patch::diff(&original, &modified);
    if patch.0.is_empty() {
        Ok(None)
    } else {
        Ok(Some(patch))
    }
}

// Drops `null` fields and empty maps, nested ones included.
fn prune_blank(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.values_mut().for_each(prune_blank);
            map.retain(|_, v| !is_blank(v));
        }
        Value::Array(items) => items.iter_mut().for_each(prune_blank),
        _ => (),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
