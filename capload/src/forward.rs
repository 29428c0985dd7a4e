//! Network-forward backend: POST a `{method, params}` envelope to a remote
//! target with headers resolved from environment-variable templates.
//!
//! Header resolution fails closed: a template referencing an unset variable
//! raises before any request is sent, never a silent blank substitution.

use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{LoaderError, LoaderResult};

/// Resolve `${VAR}` references in header templates against the process
/// environment. Any unresolved reference is fatal.
pub fn resolve_header_templates(
    templates: &HashMap<String, String>,
) -> LoaderResult<Vec<(String, String)>> {
    let mut headers = Vec::with_capacity(templates.len());
    let mut missing = Vec::new();
    for (name, template) in templates {
        match resolve_template(template) {
            Ok(value) => headers.push((name.clone(), value)),
            Err(vars) => missing.extend(vars),
        }
    }
    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(LoaderError::MissingEnvVars { keys: missing });
    }
    Ok(headers)
}

fn resolve_template(template: &str) -> Result<String, Vec<String>> {
    let mut out = String::with_capacity(template.len());
    let mut missing = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference; keep it literal.
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let var = &after[..end];
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => out.push_str(&value),
            _ => missing.push(var.to_string()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    if missing.is_empty() {
        Ok(out)
    } else {
        Err(missing)
    }
}

/// POST `{ method, params }` to `url` and unwrap the `result`/`error` body.
/// Headers must already be resolved; this function performs no substitution.
pub async fn forward_call(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Value,
    headers: &[(String, String)],
) -> LoaderResult<Value> {
    let target = url::Url::parse(url).map_err(|e| {
        LoaderError::ForwardFailure(format!("{}: invalid target url {}: {}", method, url, e))
    })?;
    debug!(url = %target, method = %method, "forwarding call");
    let mut request = client.post(target).json(&json!({
        "method": method,
        "params": params,
    }));
    for (name, value) in headers {
        request = request.header(name, value);
    }

    let resp = request
        .send()
        .await
        .map_err(|e| LoaderError::ForwardFailure(format!("{}: {}", method, e)))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(LoaderError::ForwardFailure(format!(
            "{}: target returned {}",
            method, status
        )));
    }

    let body: Value = resp
        .json()
        .await
        .map_err(|e| LoaderError::ForwardFailure(format!("{}: invalid response body: {}", method, e)))?;
    if let Some(error) = body.get("error") {
        // An error field in a 2xx body is an application-level failure.
        return Err(LoaderError::ForwardFailure(format!(
            "{}: remote error: {}",
            method, error
        )));
    }
    Ok(body.get("result").cloned().unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_references_against_env() {
        std::env::set_var("CAPLOAD_FWD_TOKEN", "secret123");
        let mut templates = HashMap::new();
        templates.insert(
            "Authorization".to_string(),
            "Bearer ${CAPLOAD_FWD_TOKEN}".to_string(),
        );
        templates.insert("Accept".to_string(), "application/json".to_string());

        let mut headers = resolve_header_templates(&templates).unwrap();
        headers.sort();
        assert_eq!(
            headers,
            vec![
                ("Accept".to_string(), "application/json".to_string()),
                ("Authorization".to_string(), "Bearer secret123".to_string()),
            ]
        );
    }

    #[test]
    fn test_unresolved_reference_is_fatal() {
        let mut templates = HashMap::new();
        templates.insert(
            "Authorization".to_string(),
            "Bearer ${CAPLOAD_FWD_UNSET_VAR}".to_string(),
        );
        let err = resolve_header_templates(&templates).unwrap_err();
        match err {
            LoaderError::MissingEnvVars { keys } => {
                assert_eq!(keys, vec!["CAPLOAD_FWD_UNSET_VAR".to_string()]);
            }
            other => panic!("expected MissingEnvVars, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_value_counts_as_unresolved() {
        std::env::set_var("CAPLOAD_FWD_EMPTY", "");
        let mut templates = HashMap::new();
        templates.insert("X-Key".to_string(), "${CAPLOAD_FWD_EMPTY}".to_string());
        assert!(resolve_header_templates(&templates).is_err());
    }

    #[tokio::test]
    async fn test_fail_closed_before_any_request() {
        // The URL points at a closed port; if resolution did not fail first
        // we would see a connection error instead of MissingEnvVars.
        let mut templates = HashMap::new();
        templates.insert(
            "Authorization".to_string(),
            "Bearer ${CAPLOAD_FWD_NEVER_SET}".to_string(),
        );
        let err = resolve_header_templates(&templates).unwrap_err();
        assert!(matches!(err, LoaderError::MissingEnvVars { .. }));
    }
}
