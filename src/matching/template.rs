use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::MatchError;

/// Placeholder names ending with this suffix consume to the end of the input.
pub const GREEDY_SUFFIX: &str = "_GRD";

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{\{\s*([A-Za-z0-9_\-.]+)\s*\}\}")
        .expect("placeholder pattern to build");
}

/// A template compiled to an anchored regular expression.
#[derive(Debug, Clone)]
pub struct TemplateRegex {
    pattern: String,
    regex: Regex,
    variables: Vec<String>,
}

impl TemplateRegex {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Names of the placeholders that became capture groups, in order.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn is_match(&self, input: &str) -> bool {
        self.regex.is_match(input)
    }

    /// Values for every unresolved placeholder, or `None` when `input` does
    /// not match. A placeholder used twice keeps its first capture.
    pub fn captures(&self, input: &str) -> Option<BTreeMap<String, String>> {
        let caps = self.regex.captures(input)?;
        let mut values = BTreeMap::new();
        for (index, name) in self.variables.iter().enumerate() {
            if let Some(found) = caps.get(index + 1) {
                values
                    .entry(name.clone())
                    .or_insert_with(|| found.as_str().to_string());
            }
        }
        Some(values)
    }
}

/// Compiles a `{{name}}` template into an anchored regex. Literal text is
/// escaped; placeholders with a known value are substituted literally and the
/// rest become capture groups.
pub fn convert_template_to_regex(
    template: &str,
    parameters: &BTreeMap<String, String>,
) -> Result<TemplateRegex, MatchError> {
    let (body, variables) = template_body(template, parameters);
    let pattern = format!("(?s)^{body}$");
    let regex = Regex::new(&pattern).map_err(|err| MatchError::InvalidPattern {
        pattern: pattern.clone(),
        reason: err.to_string(),
    })?;

    Ok(TemplateRegex {
        pattern,
        regex,
        variables,
    })
}

/// Unanchored variant used to search inside response bodies.
pub fn template_search_regex(
    template: &str,
    parameters: &BTreeMap<String, String>,
) -> Result<Regex, MatchError> {
    let (body, _) = template_body(template, parameters);
    let body = format!("(?s){body}");
    Regex::new(&body).map_err(|err| MatchError::InvalidPattern {
        pattern: body.clone(),
        reason: err.to_string(),
    })
}

/// Substitutes known parameters into `template` verbatim, leaving unknown
/// placeholders untouched.
pub fn substitute_known(template: &str, parameters: &BTreeMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match parameters.get(name) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

pub fn has_placeholders(template: &str) -> bool {
    PLACEHOLDER.is_match(template)
}

fn template_body(template: &str, parameters: &BTreeMap<String, String>) -> (String, Vec<String>) {
    let mut body = String::with_capacity(template.len() * 2);
    let mut variables = Vec::new();
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        body.push_str(&regex::escape(&template[last..whole.start()]));

        let name = &caps[1];
        match parameters.get(name) {
            Some(value) => body.push_str(&regex::escape(value)),
            None => {
                body.push_str(if name.ends_with(GREEDY_SUFFIX) {
                    "(.*)"
                } else {
                    "(.*?)"
                });
                variables.push(name.to_string());
            }
        }
        last = whole.end();
    }
    body.push_str(&regex::escape(&template[last..]));

    (body, variables)
}
