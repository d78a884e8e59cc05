//! Builds the `Cookie:` header for a captured request out of the browser's
//! cookie store, including partitioned (CHIPS) cookies.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::CookieError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKey {
    pub top_level_site: String,
}

/// A cookie as reported by the browser's cookie API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "root_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub host_only: bool,
    /// Seconds since the unix epoch; session cookies have none.
    #[serde(default)]
    pub expiration_date: Option<f64>,
    #[serde(default)]
    pub partition_key: Option<PartitionKey>,
}

fn root_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieQuery {
    pub url: Option<String>,
    pub domain: Option<String>,
    pub partition_top_level_site: Option<String>,
}

#[async_trait]
pub trait CookieStore: Send + Sync {
    async fn get_all(&self, query: CookieQuery) -> Result<Vec<BrowserCookie>, CookieError>;
}

/// Serialized `name=value; ...` header for `url`, or `None` when no cookie
/// applies. Store failures are logged and the remaining queries still run.
pub async fn collect_cookie_header(store: &dyn CookieStore, url: &str) -> Option<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default();
    collect_cookie_header_at(store, url, now).await
}

pub async fn collect_cookie_header_at(
    store: &dyn CookieStore,
    url: &str,
    now: f64,
) -> Option<String> {
    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(url, error = %err, "cannot collect cookies for unparseable url");
            return None;
        }
    };
    let host = parsed.host_str()?.to_ascii_lowercase();

    let mut queries = vec![CookieQuery {
        url: Some(url.to_string()),
        ..Default::default()
    }];
    for domain in candidate_domains(&host) {
        queries.push(CookieQuery {
            domain: Some(domain),
            ..Default::default()
        });
    }
    queries.push(CookieQuery {
        url: Some(url.to_string()),
        partition_top_level_site: Some(top_level_site(&parsed, &host)),
        ..Default::default()
    });

    let mut seen = HashSet::new();
    let mut applicable = Vec::new();
    for query in queries {
        let cookies = match store.get_all(query.clone()).await {
            Ok(cookies) => cookies,
            Err(err) => {
                warn!(error = %err, ?query, "cookie query failed");
                continue;
            }
        };
        for cookie in cookies {
            if !cookie_applies(&cookie, &parsed, now) {
                continue;
            }
            let key = (
                cookie.name.clone(),
                cookie.domain.to_ascii_lowercase(),
                cookie.path.clone(),
                cookie.partition_key.clone(),
            );
            if seen.insert(key) {
                applicable.push(cookie);
            }
        }
    }

    if applicable.is_empty() {
        debug!(host = %host, "no cookies apply");
        return None;
    }

    // Stable: equal path lengths keep the order the store returned them in.
    applicable.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
    Some(
        applicable
            .iter()
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// Whether a browser would attach `cookie` to a request for `url` at `now`.
pub fn cookie_applies(cookie: &BrowserCookie, url: &Url, now: f64) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    let domain = cookie.domain.trim_start_matches('.').to_ascii_lowercase();

    let domain_ok = if cookie.host_only {
        host == domain
    } else {
        host == domain || host.ends_with(&format!(".{domain}"))
    };
    if !domain_ok {
        return false;
    }

    if !path_matches(url.path(), &cookie.path) {
        return false;
    }

    if cookie.secure && !matches!(url.scheme(), "https" | "wss") {
        return false;
    }

    match cookie.expiration_date {
        Some(expires) => expires > now,
        None => true,
    }
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if cookie_path.is_empty() || request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

/// The host and every parent domain with at least two labels.
fn candidate_domains(host: &str) -> Vec<String> {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return vec![host.to_string()];
    }
    (0..labels.len() - 1)
        .map(|start| labels[start..].join("."))
        .collect()
}

fn top_level_site(url: &Url, host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    let site = if labels.len() > 2 {
        labels[labels.len() - 2..].join(".")
    } else {
        host.to_string()
    };
    format!("{}://{}", url.scheme(), site)
}
