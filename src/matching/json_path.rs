//! JSONPath subset used by provider redactions: `$`, `.key`, `['key']`,
//! `[n]`, `[*]`, `.*` and `..key`.

use serde_json::Value;

use crate::error::MatchError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Child(String),
    Index(usize),
    Wildcard,
    Descendant(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

impl JsonPath {
    pub fn parse(path: &str) -> Result<Self, MatchError> {
        let invalid = || MatchError::InvalidJsonPath(path.to_string());
        let rest = path.trim();
        let mut rest = rest.strip_prefix('$').ok_or_else(invalid)?;
        let mut segments = Vec::new();

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix("..") {
                let (name, tail) = split_name(after);
                if name.is_empty() {
                    return Err(invalid());
                }
                segments.push(Segment::Descendant(name.to_string()));
                rest = tail;
            } else if let Some(after) = rest.strip_prefix('.') {
                if let Some(tail) = after.strip_prefix('*') {
                    segments.push(Segment::Wildcard);
                    rest = tail;
                    continue;
                }
                let (name, tail) = split_name(after);
                if name.is_empty() {
                    return Err(invalid());
                }
                segments.push(Segment::Child(name.to_string()));
                rest = tail;
            } else if let Some(after) = rest.strip_prefix('[') {
                let close = after.find(']').ok_or_else(invalid)?;
                let inner = after[..close].trim();
                segments.push(parse_bracket(inner).ok_or_else(invalid)?);
                rest = &after[close + 1..];
            } else {
                return Err(invalid());
            }
        }

        Ok(Self { segments })
    }

    /// Every node selected by the path, in document order.
    pub fn select<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut current = vec![root];
        for segment in &self.segments {
            let mut next = Vec::new();
            for node in current {
                apply_segment(segment, node, &mut next);
            }
            current = next;
        }
        current
    }

    /// First selected node rendered as text: strings verbatim, everything
    /// else as compact JSON.
    pub fn first_text(&self, root: &Value) -> Option<String> {
        self.select(root).into_iter().next().map(render)
    }
}

pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn split_name(input: &str) -> (&str, &str) {
    let end = input
        .find(|c: char| c == '.' || c == '[')
        .unwrap_or(input.len());
    (&input[..end], &input[end..])
}

fn parse_bracket(inner: &str) -> Option<Segment> {
    if inner == "*" {
        return Some(Segment::Wildcard);
    }
    if let Ok(index) = inner.parse::<usize>() {
        return Some(Segment::Index(index));
    }
    let quoted = inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))?;
    Some(Segment::Child(quoted.to_string()))
}

fn apply_segment<'a>(segment: &Segment, node: &'a Value, out: &mut Vec<&'a Value>) {
    match segment {
        Segment::Child(name) => {
            if let Some(child) = node.get(name.as_str()) {
                out.push(child);
            }
        }
        Segment::Index(index) => {
            if let Some(child) = node.get(*index) {
                out.push(child);
            }
        }
        Segment::Wildcard => match node {
            Value::Array(items) => out.extend(items.iter()),
            Value::Object(map) => out.extend(map.values()),
            _ => {}
        },
        Segment::Descendant(name) => collect_descendants(name, node, out),
    }
}

fn collect_descendants<'a>(name: &str, node: &'a Value, out: &mut Vec<&'a Value>) {
    match node {
        Value::Object(map) => {
            if let Some(found) = map.get(name) {
                out.push(found);
            }
            for child in map.values() {
                collect_descendants(name, child, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_descendants(name, child, out);
            }
        }
        _ => {}
    }
}
