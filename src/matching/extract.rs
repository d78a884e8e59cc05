use std::collections::BTreeMap;

use tracing::debug;

use super::{resolve_redaction, template};
use crate::provider::{CapturedRequest, CapturedResponse, RequestTemplate};

/// Parameters split by sensitivity. Names containing "secret" in any case
/// never reach the public claim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeparatedParameters {
    pub public: BTreeMap<String, String>,
    pub secret: BTreeMap<String, String>,
}

/// Collects every parameter value a matched pair yields: placeholders
/// captured from the url and body templates, plus named groups and
/// placeholder captures from the response redactions. Extracted values are
/// layered over `known`.
pub fn extract_parameters(
    criteria: &RequestTemplate,
    request: &CapturedRequest,
    response: Option<&CapturedResponse>,
    known: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut values = known.clone();

    match template::convert_template_to_regex(&criteria.url, known) {
        Ok(compiled) => {
            if let Some(found) = compiled.captures(&request.url) {
                values.extend(found);
            }
        }
        Err(err) => debug!(error = %err, "url template unusable for extraction"),
    }

    if criteria.body_sniff.enabled && !criteria.body_sniff.template.is_empty() {
        let body = request.body.as_deref().unwrap_or("");
        match template::convert_template_to_regex(&criteria.body_sniff.template, known) {
            Ok(compiled) => {
                if let Some(found) = compiled.captures(body) {
                    values.extend(found);
                }
            }
            Err(err) => debug!(error = %err, "body template unusable for extraction"),
        }
    }

    let Some(response) = response else {
        return values;
    };

    for rule in &criteria.response_matches {
        if rule.invert || !template::has_placeholders(&rule.value) {
            continue;
        }
        if let Ok(search) = template::template_search_regex(&rule.value, &values) {
            if let Some(caps) = search.captures(&response.body) {
                let names = placeholder_names(&rule.value, &values);
                for (index, name) in names.into_iter().enumerate() {
                    if let Some(found) = caps.get(index + 1) {
                        values.entry(name).or_insert_with(|| found.as_str().to_string());
                    }
                }
            }
        }
    }

    let parsed = serde_json::from_str::<serde_json::Value>(&response.body).ok();
    for redaction in &criteria.response_redactions {
        match resolve_redaction(&response.body, parsed.as_ref(), redaction) {
            Ok(Some(resolved)) => values.extend(resolved.named),
            Ok(None) => {}
            Err(err) => debug!(error = %err, "redaction unusable for extraction"),
        }
    }

    values
}

/// Placeholders in `value` that are still unresolved, in order of
/// appearance.
fn placeholder_names(value: &str, known: &BTreeMap<String, String>) -> Vec<String> {
    template::convert_template_to_regex(value, known)
        .map(|compiled| compiled.variables().to_vec())
        .unwrap_or_default()
}

pub fn separate_parameters(values: &BTreeMap<String, String>) -> SeparatedParameters {
    let mut separated = SeparatedParameters::default();
    for (name, value) in values {
        let bucket = if name.to_ascii_lowercase().contains("secret") {
            &mut separated.secret
        } else {
            &mut separated.public
        };
        bucket.insert(name.clone(), value.clone());
    }
    separated
}
