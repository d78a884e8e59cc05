//! XPath-like extraction over HTML/XML response text.
//!
//! Supported forms: `//tag`, `//*`, an optional `[@attr='value']` predicate,
//! and an optional trailing `/text()` or `/@attr`.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::MatchError;

lazy_static! {
    static ref XPATH: Regex = Regex::new(
        r#"^//([A-Za-z][A-Za-z0-9_\-:]*|\*)(?:\[@([A-Za-z_:][A-Za-z0-9_\-:.]*)\s*=\s*(?:'([^']*)'|"([^"]*)")\])?(/text\(\)|/@[A-Za-z_:][A-Za-z0-9_\-:.]*)?$"#
    )
    .expect("xpath grammar to build");
    static ref ATTRIBUTE: Regex =
        Regex::new(r#"([A-Za-z_:][A-Za-z0-9_\-:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>/]+))"#)
            .expect("attribute pattern to build");
    static ref ANY_TAG: Regex = Regex::new(r"<[^>]*>").expect("tag pattern to build");
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Output {
    Element,
    Text,
    Attribute(String),
}

#[derive(Debug, Clone)]
pub struct XPathLite {
    tag: Option<String>,
    predicate: Option<(String, String)>,
    output: Output,
    open: Regex,
}

impl XPathLite {
    pub fn parse(expr: &str) -> Result<Self, MatchError> {
        let expr = expr.trim();
        let caps = XPATH
            .captures(expr)
            .ok_or_else(|| MatchError::InvalidXPath(expr.to_string()))?;

        let tag = match &caps[1] {
            "*" => None,
            name => Some(name.to_ascii_lowercase()),
        };
        let predicate = caps.get(2).map(|attr| {
            let value = caps
                .get(3)
                .or_else(|| caps.get(4))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            (attr.as_str().to_string(), value)
        });
        let output = match caps.get(5).map(|m| m.as_str()) {
            Some("/text()") => Output::Text,
            Some(attr) => Output::Attribute(attr.trim_start_matches("/@").to_string()),
            None => Output::Element,
        };

        let tag_pattern = tag.as_deref().map(regex::escape).unwrap_or_else(|| r"[A-Za-z][A-Za-z0-9_\-:]*".to_string());
        let open = Regex::new(&format!(r"(?i)<({tag_pattern})(\s[^>]*?)?(/?)>"))
            .map_err(|_| MatchError::InvalidXPath(expr.to_string()))?;

        Ok(Self {
            tag,
            predicate,
            output,
            open,
        })
    }

    /// Extracts from the first element satisfying the expression.
    pub fn first(&self, document: &str) -> Option<String> {
        for caps in self.open.captures_iter(document) {
            let whole = caps.get(0)?;
            let name = caps.get(1)?.as_str();
            let attrs = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            let self_closing = caps.get(3).map(|m| !m.as_str().is_empty()).unwrap_or(false);

            if let Some((attr, expected)) = &self.predicate {
                if attribute(attrs, attr).as_deref() != Some(expected.as_str()) {
                    continue;
                }
            }

            return match &self.output {
                Output::Attribute(attr) => attribute(attrs, attr),
                Output::Text => {
                    let inner = if self_closing {
                        ""
                    } else {
                        inner_content(document, whole.end(), name)?.0
                    };
                    Some(ANY_TAG.replace_all(inner, "").trim().to_string())
                }
                Output::Element => {
                    if self_closing {
                        Some(whole.as_str().to_string())
                    } else {
                        let (_, end) = inner_content(document, whole.end(), name)?;
                        Some(document[whole.start()..end].to_string())
                    }
                }
            };
        }
        None
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

fn attribute(attrs: &str, name: &str) -> Option<String> {
    ATTRIBUTE.captures_iter(attrs).find_map(|caps| {
        if !caps[1].eq_ignore_ascii_case(name) {
            return None;
        }
        caps.get(2)
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map(|m| m.as_str().to_string())
    })
}

/// Content between the opening tag ending at `start` and its matching close
/// tag, plus the byte offset just past the close tag. Nested elements with the
/// same name are balanced.
fn inner_content<'a>(document: &'a str, start: usize, name: &str) -> Option<(&'a str, usize)> {
    let lower = document.to_ascii_lowercase();
    let name = name.to_ascii_lowercase();
    let open_token = format!("<{name}");
    let close_token = format!("</{name}");
    let mut depth = 1usize;
    let mut cursor = start;

    loop {
        let next_close = lower[cursor..].find(&close_token)? + cursor;
        let next_open = lower[cursor..]
            .find(&open_token)
            .map(|idx| idx + cursor)
            .filter(|idx| *idx < next_close && is_tag_boundary(&lower, idx + open_token.len()));

        match next_open {
            Some(open_at) => {
                depth += 1;
                cursor = open_at + open_token.len();
            }
            None => {
                depth -= 1;
                let close_end = lower[next_close..].find('>')? + next_close + 1;
                if depth == 0 {
                    return Some((&document[start..next_close], close_end));
                }
                cursor = close_end;
            }
        }
    }
}

fn is_tag_boundary(lower: &str, idx: usize) -> bool {
    matches!(
        lower.as_bytes().get(idx),
        Some(b'>') | Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r') | Some(b'/')
    )
}
