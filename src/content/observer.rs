//! Rolling buffer of intercepted traffic and the template filter over it.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::{debug, info, trace};

use crate::config::FilterPolicy;
use crate::matching::{matches_request_criteria, matches_response};
use crate::messages::FilteredRequest;
use crate::provider::{InterceptedRequestResponse, RequestTemplate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    /// No filter run has been started, or the last one ended.
    Inactive,
    Filtering,
    /// Every template was satisfied on this scan; the buffer is closed.
    Complete,
    /// The absolute filter timeout elapsed on this scan.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    pub found: Vec<FilteredRequest>,
    pub status: FilterStatus,
}

impl ScanOutcome {
    fn idle(status: FilterStatus) -> Self {
        Self {
            found: Vec::new(),
            status,
        }
    }
}

#[derive(Debug)]
struct FilterRun {
    templates: Vec<RequestTemplate>,
    parameters: BTreeMap<String, String>,
    session_id: String,
    login_url: String,
    started_at_ms: u64,
}

/// Buffer plus filter state for one tab. Times are unix epoch milliseconds
/// supplied by the caller.
#[derive(Debug)]
pub struct NetworkObserver {
    policy: FilterPolicy,
    buffer: Vec<(String, InterceptedRequestResponse)>,
    keys: HashSet<String>,
    filtered: HashSet<String>,
    /// Indices into the run's templates.
    satisfied: BTreeSet<usize>,
    run: Option<FilterRun>,
    closed: bool,
}

impl NetworkObserver {
    pub fn new(policy: FilterPolicy) -> Self {
        Self {
            policy,
            buffer: Vec::new(),
            keys: HashSet::new(),
            filtered: HashSet::new(),
            satisfied: BTreeSet::new(),
            run: None,
            closed: false,
        }
    }

    /// Buffers one intercepted pair. Returns false when the buffer is closed
    /// or the key was already seen.
    pub fn ingest(&mut self, entry: InterceptedRequestResponse) -> bool {
        if self.closed {
            trace!(url = %entry.request.url, "buffer closed, capture dropped");
            return false;
        }
        let key = entry.buffer_key();
        if !self.keys.insert(key.clone()) {
            return false;
        }
        self.buffer.push((key, entry));
        true
    }

    /// Begins filtering for a session. Entries captured before the call are
    /// scanned too.
    pub fn start(
        &mut self,
        templates: Vec<RequestTemplate>,
        parameters: BTreeMap<String, String>,
        session_id: impl Into<String>,
        login_url: impl Into<String>,
        now_ms: u64,
    ) {
        let session_id = session_id.into();
        info!(session_id = %session_id, templates = templates.len(), "network filtering started");
        self.closed = false;
        self.filtered.clear();
        self.satisfied.clear();
        self.run = Some(FilterRun {
            templates,
            parameters,
            session_id,
            login_url: login_url.into(),
            started_at_ms: now_ms,
        });
    }

    pub fn stop(&mut self) {
        if self.run.take().is_some() {
            debug!("network filtering stopped");
        }
    }

    pub fn is_filtering(&self) -> bool {
        self.run.is_some()
    }

    /// Session of the active filter run.
    pub fn session_id(&self) -> Option<&str> {
        self.run.as_ref().map(|run| run.session_id.as_str())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn satisfied(&self) -> usize {
        self.satisfied.len()
    }

    /// One pass of the filter loop: prune, check the deadline, then look for
    /// the first unfiltered match of every unsatisfied template.
    pub fn scan(&mut self, now_ms: u64) -> ScanOutcome {
        self.prune(now_ms);

        let Some(run) = self.run.as_ref() else {
            return ScanOutcome::idle(FilterStatus::Inactive);
        };
        if now_ms.saturating_sub(run.started_at_ms) >= millis(self.policy.max_duration) {
            info!(session_id = %run.session_id, satisfied = self.satisfied.len(), "network filtering timed out");
            self.run = None;
            return ScanOutcome::idle(FilterStatus::TimedOut);
        }

        let mut found = Vec::new();
        for (index, template) in run.templates.iter().enumerate() {
            if self.satisfied.contains(&index) {
                continue;
            }
            let hit = self.buffer.iter().find(|(key, entry)| {
                !self.filtered.contains(key)
                    && matches_request_criteria(&entry.request, template, &run.parameters)
                    && matches_response(&entry.response, template, &run.parameters)
            });
            let Some((key, entry)) = hit else {
                continue;
            };

            debug!(
                session_id = %run.session_id,
                request_hash = %template.request_hash,
                url = %entry.request.url,
                "request matched template"
            );
            self.filtered.insert(key.clone());
            self.satisfied.insert(index);
            found.push(FilteredRequest {
                request: entry.request.clone(),
                response: Some(entry.response.clone()),
                criteria: template.clone(),
                session_id: run.session_id.clone(),
                login_url: run.login_url.clone(),
            });
        }

        if self.satisfied.len() >= run.templates.len() {
            info!(session_id = %run.session_id, "all templates satisfied, closing buffer");
            self.run = None;
            self.closed = true;
            self.buffer.clear();
            self.keys.clear();
            return ScanOutcome {
                found,
                status: FilterStatus::Complete,
            };
        }

        ScanOutcome {
            found,
            status: FilterStatus::Filtering,
        }
    }

    fn prune(&mut self, now_ms: u64) {
        let retention = millis(self.policy.retention);
        let before = self.buffer.len();
        let keys = &mut self.keys;
        self.buffer.retain(|(key, entry)| {
            let fresh = now_ms.saturating_sub(entry.timestamp) <= retention;
            if !fresh {
                keys.remove(key);
            }
            fresh
        });
        let pruned = before - self.buffer.len();
        if pruned > 0 {
            trace!(pruned, "stale captures pruned");
        }
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CapturedRequest, CapturedResponse, ResponseMatch, UrlType};

    const T0: u64 = 1_700_000_000_000;

    fn capture(url: &str, body: &str, timestamp: u64) -> InterceptedRequestResponse {
        InterceptedRequestResponse {
            request: CapturedRequest {
                url: url.into(),
                method: "GET".into(),
                ..Default::default()
            },
            response: CapturedResponse {
                status: 200,
                body: body.into(),
                ..Default::default()
            },
            timestamp,
        }
    }

    fn template(url: &str, hash: &str, contains: &str) -> RequestTemplate {
        RequestTemplate {
            url: url.into(),
            method: "GET".into(),
            url_type: UrlType::Template,
            response_matches: vec![ResponseMatch {
                kind: Default::default(),
                value: contains.into(),
                invert: false,
                hash: None,
            }],
            response_redactions: Vec::new(),
            body_sniff: Default::default(),
            request_hash: hash.into(),
        }
    }

    fn observer() -> NetworkObserver {
        NetworkObserver::new(FilterPolicy::default())
    }

    #[test]
    fn test_first_match_per_template_then_close() {
        let mut observer = observer();
        observer.ingest(capture("https://x.com/api/me", r#"{"ok":true}"#, T0));
        observer.ingest(capture("https://x.com/api/me", r#"{"ok":true}"#, T0 + 5));
        observer.start(
            vec![template("https://x.com/api/me", "h1", "\"ok\":true")],
            BTreeMap::new(),
            "s1",
            "https://x.com/login",
            T0,
        );

        let outcome = observer.scan(T0 + 10);

        assert_eq!(outcome.status, FilterStatus::Complete);
        assert_eq!(outcome.found.len(), 1);
        assert_eq!(outcome.found[0].criteria.request_hash, "h1");
        assert_eq!(outcome.found[0].session_id, "s1");
        assert_eq!(outcome.found[0].login_url, "https://x.com/login");
        assert!(observer.is_closed());
        assert_eq!(observer.buffered(), 0);
        assert!(!observer.ingest(capture("https://x.com/api/me", "{}", T0 + 20)));
        assert_eq!(observer.scan(T0 + 30).status, FilterStatus::Inactive);
    }

    #[test]
    fn test_matched_key_is_not_resubmitted() {
        let mut observer = observer();
        observer.start(
            vec![
                template("https://x.com/api/me", "h1", "ok"),
                template("https://x.com/api/{{anything}}", "h2", "ok"),
            ],
            BTreeMap::new(),
            "s1",
            "",
            T0,
        );
        observer.ingest(capture("https://x.com/api/me", "ok", T0));

        let first = observer.scan(T0 + 1);
        assert_eq!(first.found.len(), 1);
        assert_eq!(first.status, FilterStatus::Filtering);

        let second = observer.scan(T0 + 2);
        assert!(second.found.is_empty());

        observer.ingest(capture("https://x.com/api/feed", "ok", T0 + 3));
        let third = observer.scan(T0 + 4);
        assert_eq!(third.found[0].criteria.request_hash, "h2");
        assert_eq!(third.status, FilterStatus::Complete);
    }

    #[test]
    fn test_templates_sharing_a_hash_complete_independently() {
        let mut observer = observer();
        observer.start(
            vec![
                template("https://x.com/api/me", "shared", "ok"),
                template("https://x.com/api/feed", "shared", "ok"),
            ],
            BTreeMap::new(),
            "s1",
            "",
            T0,
        );
        observer.ingest(capture("https://x.com/api/me", "ok", T0));

        let first = observer.scan(T0 + 1);
        assert_eq!(first.found.len(), 1);
        assert_eq!(first.status, FilterStatus::Filtering);
        assert_eq!(observer.satisfied(), 1);

        observer.ingest(capture("https://x.com/api/feed", "ok", T0 + 2));
        let second = observer.scan(T0 + 3);
        assert_eq!(second.found.len(), 1);
        assert_eq!(second.found[0].request.url, "https://x.com/api/feed");
        assert_eq!(second.status, FilterStatus::Complete);
    }

    #[test]
    fn test_non_matching_response_is_skipped() {
        let mut observer = observer();
        observer.start(
            vec![template("https://x.com/api/me", "h1", "\"ok\":true")],
            BTreeMap::new(),
            "s1",
            "",
            T0,
        );
        observer.ingest(capture("https://x.com/api/me", r#"{"ok":false}"#, T0));

        let outcome = observer.scan(T0 + 1);

        assert!(outcome.found.is_empty());
        assert_eq!(outcome.status, FilterStatus::Filtering);
    }

    #[test]
    fn test_stale_entries_are_pruned() {
        let mut observer = observer();
        observer.ingest(capture("https://x.com/a", "", T0));
        observer.ingest(capture("https://x.com/b", "", T0 + 90_000));

        observer.scan(T0 + 150_000);

        assert_eq!(observer.buffered(), 1);
        assert!(observer.ingest(capture("https://x.com/a", "", T0)));
    }

    #[test]
    fn test_filter_self_terminates_after_deadline() {
        let mut observer = observer();
        observer.start(
            vec![template("https://x.com/api/me", "h1", "ok")],
            BTreeMap::new(),
            "s1",
            "",
            T0,
        );

        assert_eq!(observer.scan(T0 + 599_000).status, FilterStatus::Filtering);
        assert_eq!(observer.scan(T0 + 600_000).status, FilterStatus::TimedOut);
        assert!(!observer.is_filtering());
    }

    #[test]
    fn test_duplicate_capture_is_ignored() {
        let mut observer = observer();
        assert!(observer.ingest(capture("https://x.com/a", "", T0)));
        assert!(!observer.ingest(capture("https://x.com/a", "", T0)));
        assert_eq!(observer.buffered(), 1);
    }
}
