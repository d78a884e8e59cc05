//! Request matching against provider templates, and parameter extraction
//! from matched pairs.

pub mod extract;
pub mod json_path;
pub mod template;
pub mod xpath;

use std::collections::BTreeMap;

use regex::Regex;
use tracing::{debug, trace};

use crate::error::MatchError;
use crate::provider::{
    CapturedRequest, CapturedResponse, MatchKind, RequestTemplate, ResponseMatch, ResponseRedaction,
    UrlType,
};

pub use extract::{extract_parameters, separate_parameters, SeparatedParameters};
pub use json_path::JsonPath;
pub use template::{convert_template_to_regex, TemplateRegex};
pub use xpath::XPathLite;

/// Whether the request's url, method and (when sniffed) body satisfy the
/// template. Invalid provider patterns never match.
pub fn matches_request_criteria(
    request: &CapturedRequest,
    template: &RequestTemplate,
    parameters: &BTreeMap<String, String>,
) -> bool {
    if !request.method.eq_ignore_ascii_case(&template.method) {
        return false;
    }

    let url_matches = match url_matches(&request.url, template, parameters) {
        Ok(matched) => matched,
        Err(err) => {
            debug!(request_hash = %template.request_hash, error = %err, "url pattern rejected");
            false
        }
    };
    if !url_matches {
        return false;
    }

    if template.body_sniff.enabled && !template.body_sniff.template.is_empty() {
        let body = request.body.as_deref().unwrap_or("");
        return match convert_template_to_regex(&template.body_sniff.template, parameters) {
            Ok(compiled) => compiled.is_match(body),
            Err(err) => {
                debug!(request_hash = %template.request_hash, error = %err, "body template rejected");
                false
            }
        };
    }

    true
}

fn url_matches(
    url: &str,
    template: &RequestTemplate,
    parameters: &BTreeMap<String, String>,
) -> Result<bool, MatchError> {
    if url == template.url {
        return Ok(true);
    }
    match template.url_type {
        UrlType::Exact => Ok(false),
        UrlType::Regex => {
            let regex = compile(&template.url)?;
            Ok(regex.is_match(url))
        }
        UrlType::Template => Ok(convert_template_to_regex(&template.url, parameters)?.is_match(url)),
    }
}

/// Whether every response match holds and every redaction resolves to a
/// non-empty value.
pub fn matches_response(
    response: &CapturedResponse,
    template: &RequestTemplate,
    parameters: &BTreeMap<String, String>,
) -> bool {
    for rule in &template.response_matches {
        match response_match_holds(&response.body, rule, parameters) {
            Ok(true) => {}
            Ok(false) => {
                trace!(request_hash = %template.request_hash, value = %rule.value, "response match failed");
                return false;
            }
            Err(err) => {
                debug!(request_hash = %template.request_hash, error = %err, "response match rejected");
                return false;
            }
        }
    }

    let parsed = serde_json::from_str::<serde_json::Value>(&response.body).ok();
    for redaction in &template.response_redactions {
        match resolve_redaction(&response.body, parsed.as_ref(), redaction) {
            Ok(Some(resolved)) if !resolved.value.is_empty() => {}
            Ok(_) => {
                trace!(request_hash = %template.request_hash, "redaction resolved empty");
                return false;
            }
            Err(err) => {
                debug!(request_hash = %template.request_hash, error = %err, "redaction rejected");
                return false;
            }
        }
    }

    true
}

fn response_match_holds(
    body: &str,
    rule: &ResponseMatch,
    parameters: &BTreeMap<String, String>,
) -> Result<bool, MatchError> {
    let found = match rule.kind {
        MatchKind::Contains => {
            let expected = template::substitute_known(&rule.value, parameters);
            if template::has_placeholders(&expected) {
                template::template_search_regex(&rule.value, parameters)?.is_match(body)
            } else {
                body.contains(&expected)
            }
        }
        MatchKind::Regex => {
            let pattern = substitute_escaped(&rule.value, parameters);
            compile(&pattern)?.is_match(body)
        }
    };
    Ok(found != rule.invert)
}

/// Substitutes known parameters into a regex source, escaping each value.
fn substitute_escaped(pattern: &str, parameters: &BTreeMap<String, String>) -> String {
    let escaped: BTreeMap<String, String> = parameters
        .iter()
        .map(|(k, v)| (k.clone(), regex::escape(v)))
        .collect();
    template::substitute_known(pattern, &escaped)
}

/// Output of a single redaction: the selected text plus any named regex
/// groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRedaction {
    pub value: String,
    pub named: BTreeMap<String, String>,
}

/// Resolves one redaction. JSON path applies when the body is JSON, XPath
/// when it is not; the regex, if any, then runs over the selected segment
/// (or the whole body).
pub fn resolve_redaction(
    body: &str,
    parsed: Option<&serde_json::Value>,
    redaction: &ResponseRedaction,
) -> Result<Option<ResolvedRedaction>, MatchError> {
    let mut segment: Option<String> = None;

    if !redaction.json_path.is_empty() {
        if let Some(json) = parsed {
            segment = Some(match JsonPath::parse(&redaction.json_path)?.first_text(json) {
                Some(text) => text,
                None => return Ok(None),
            });
        }
    }
    if segment.is_none() && parsed.is_none() && !redaction.x_path.is_empty() {
        segment = Some(match XPathLite::parse(&redaction.x_path)?.first(body) {
            Some(text) => text,
            None => return Ok(None),
        });
    }

    let scope = segment.as_deref().unwrap_or(body);
    if redaction.regex.is_empty() {
        return Ok(segment.map(|value| ResolvedRedaction {
            value,
            named: BTreeMap::new(),
        }));
    }

    let regex = compile(&redaction.regex)?;
    let Some(caps) = regex.captures(scope) else {
        return Ok(None);
    };
    let mut named = BTreeMap::new();
    for name in regex.capture_names().flatten() {
        if let Some(found) = caps.name(name) {
            named.insert(name.to_string(), found.as_str().to_string());
        }
    }
    let value = caps
        .get(0)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    Ok(Some(ResolvedRedaction { value, named }))
}

fn compile(pattern: &str) -> Result<Regex, MatchError> {
    Regex::new(pattern).map_err(|err| MatchError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: err.to_string(),
    })
}
