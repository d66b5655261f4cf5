//! Request journal used for post-hoc verification.

use crate::matcher::{CompiledMatcher, MatchContext};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// A request as received by the server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    /// Decoded path
    pub path: String,
    pub query: Option<String>,
    /// Headers keyed by lower-cased name
    pub headers: HashMap<String, String>,
    pub body: String,
    /// Id of the stub that answered, `None` for the default response
    pub matched_stub: Option<String>,
    pub received_at: DateTime<Utc>,
    context: MatchContext,
}

impl RecordedRequest {
    pub(crate) fn new(ctx: &MatchContext, matched_stub: Option<String>) -> Self {
        Self {
            method: ctx.method.clone(),
            path: ctx.path.clone(),
            query: ctx.query_string.clone(),
            headers: ctx.headers.clone(),
            body: ctx.body.clone(),
            matched_stub,
            received_at: Utc::now(),
            context: ctx.clone(),
        }
    }
}

/// Append-only log of received requests.
#[derive(Debug, Default)]
pub struct RequestJournal {
    entries: RwLock<Vec<RecordedRequest>>,
}

impl RequestJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, request: RecordedRequest) {
        self.entries.write().push(request);
    }

    /// Number of recorded requests satisfying `matcher`.
    pub fn count_matching(&self, matcher: &CompiledMatcher) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|entry| matcher.matches(&entry.context))
            .count()
    }

    /// Snapshot of every recorded request, oldest first.
    pub fn entries(&self) -> Vec<RecordedRequest> {
        self.entries.read().clone()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RequestMatcher;
    use serde_json::json;

    fn record(journal: &RequestJournal, method: &str, path: &str, body: &str) {
        let ctx = MatchContext::new(method, path, None, HashMap::new(), body.as_bytes());
        journal.record(RecordedRequest::new(&ctx, None));
    }

    #[test]
    fn test_count_matching() {
        let journal = RequestJournal::new();
        record(&journal, "GET", "/books/1", "");
        record(&journal, "GET", "/books/2", "");
        record(&journal, "POST", "/books", r#"{"title":"Dune"}"#);

        let gets =
            CompiledMatcher::compile(&RequestMatcher::get().path_regex("/books/\\d+")).unwrap();
        assert_eq!(journal.count_matching(&gets), 2);

        let create = CompiledMatcher::compile(
            &RequestMatcher::post()
                .path_exact("/books")
                .body_json(json!({"title": "Dune"})),
        )
        .unwrap();
        assert_eq!(journal.count_matching(&create), 1);

        let delete = CompiledMatcher::compile(&RequestMatcher::delete()).unwrap();
        assert_eq!(journal.count_matching(&delete), 0);
    }

    #[test]
    fn test_clear() {
        let journal = RequestJournal::new();
        record(&journal, "GET", "/", "");
        assert_eq!(journal.len(), 1);
        journal.clear();
        assert!(journal.is_empty());
    }
}
