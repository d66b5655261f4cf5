//! Request matching logic.
//!
//! Request patterns are compiled once, at registration, into a
//! [`CompiledMatcher`] and then evaluated against the [`MatchContext`] built
//! for every inbound request.

use crate::config::{
    HeaderMatcher, HttpMethod, JsonBodyMatcher, PathMatcher, RawBodyMatcher, RequestMatcher,
};
use crate::error::{MockServerError, Result};
use regex::Regex;
use serde_json::{Number, Value};
use std::borrow::Cow;
use std::collections::HashMap;

/// Per-request view of method, path, headers and body used for matching and
/// template rendering.
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// Upper-cased request method
    pub method: String,
    /// Percent-decoded request path
    pub path: String,
    /// Non-empty path segments, split on `/` before decoding so an encoded
    /// `%2F` stays inside its segment
    pub segments: Vec<String>,
    /// Raw query string, if any
    pub query_string: Option<String>,
    /// Decoded query parameters
    pub query: HashMap<String, String>,
    /// Request headers keyed by lower-cased name
    pub headers: HashMap<String, String>,
    /// Raw body text (empty when the request had no body)
    pub body: String,
    /// Parsed body, when it is valid JSON and the `Content-Type` header is
    /// either absent or names a JSON media type
    pub json: Option<Value>,
}

impl MatchContext {
    /// Build a context from the parts of a live request.
    pub fn new(
        method: &str,
        raw_path: &str,
        query_string: Option<&str>,
        headers: HashMap<String, String>,
        body: &[u8],
    ) -> Self {
        let path = decode(raw_path);
        let segments = raw_path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(decode)
            .collect();
        let headers: HashMap<String, String> = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();

        let body = String::from_utf8_lossy(body).into_owned();
        let json_content = headers
            .get("content-type")
            .map(|ct| ct.to_ascii_lowercase().contains("json"))
            .unwrap_or(true);
        let json = if json_content && !body.trim().is_empty() {
            serde_json::from_str(&body).ok()
        } else {
            None
        };

        Self {
            method: method.to_ascii_uppercase(),
            path,
            segments,
            query_string: query_string.map(String::from),
            query: parse_query_string(query_string.unwrap_or("")),
            headers,
            body,
            json,
        }
    }
}

/// How narrowly a stub constrains requests. Higher wins during selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Specificity {
    /// Only the method (possibly `ANY`) is constrained
    MethodOnly,
    /// Prefix, regex or glob path
    PatternPath,
    /// Exact path
    ExactPath,
    /// Any body predicate, structural or raw
    Body,
}

/// A request pattern with its regexes, globs and header names prepared.
#[derive(Debug)]
pub struct CompiledMatcher {
    method: HttpMethod,
    path: Option<CompiledPath>,
    headers: Vec<(String, CompiledHeader)>,
    body: Option<CompiledBody>,
}

#[derive(Debug)]
enum CompiledPath {
    Exact(String),
    Prefix(String),
    Regex(Regex),
    Glob(globset::GlobMatcher),
}

#[derive(Debug)]
enum CompiledHeader {
    Exact(String),
    Regex(Regex),
    Present,
    Absent,
    Contains(String),
}

#[derive(Debug)]
enum CompiledBody {
    EqualToJson { expected: Value, options: JsonCompare },
    JsonPath(Vec<(String, Value)>),
    RawRegex(Regex),
    RawContains(String),
    RawExact(String),
    RawEmpty,
}

/// Options for structural JSON comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCompare {
    pub ignore_array_order: bool,
    pub ignore_extra_elements: bool,
}

impl CompiledMatcher {
    /// Compile a request pattern, rejecting invalid or contradictory ones.
    pub fn compile(matcher: &RequestMatcher) -> Result<Self> {
        if matcher.body.is_some() && matcher.raw_body.is_some() {
            return Err(MockServerError::config(
                "a stub may set either a JSON body predicate or a raw body predicate, not both",
            ));
        }

        let path = matcher.path.as_ref().map(compile_path).transpose()?;

        let mut headers = Vec::with_capacity(matcher.headers.len());
        for (name, hm) in &matcher.headers {
            let compiled = match hm {
                HeaderMatcher::Exact { value } => CompiledHeader::Exact(value.clone()),
                HeaderMatcher::Regex { pattern } => CompiledHeader::Regex(compile_regex(pattern)?),
                HeaderMatcher::Present => CompiledHeader::Present,
                HeaderMatcher::Absent => CompiledHeader::Absent,
                HeaderMatcher::Contains { value } => CompiledHeader::Contains(value.clone()),
            };
            headers.push((name.to_ascii_lowercase(), compiled));
        }

        let body = match (&matcher.body, &matcher.raw_body) {
            (
                Some(JsonBodyMatcher::EqualToJson {
                    value,
                    ignore_array_order,
                    ignore_extra_elements,
                }),
                _,
            ) => Some(CompiledBody::EqualToJson {
                expected: value.clone(),
                options: JsonCompare {
                    ignore_array_order: *ignore_array_order,
                    ignore_extra_elements: *ignore_extra_elements,
                },
            }),
            (Some(JsonBodyMatcher::JsonPath { expressions }), _) => {
                use jsonpath_rust::JsonPath;

                let mut compiled = Vec::with_capacity(expressions.len());
                for (expr, expected) in expressions {
                    let _: JsonPath = JsonPath::try_from(expr.as_str()).map_err(|_| {
                        MockServerError::config(format!("invalid JSON path expression: {}", expr))
                    })?;
                    compiled.push((expr.clone(), expected.clone()));
                }
                Some(CompiledBody::JsonPath(compiled))
            }
            (None, Some(RawBodyMatcher::Regex { pattern })) => {
                Some(CompiledBody::RawRegex(compile_regex(pattern)?))
            }
            (None, Some(RawBodyMatcher::Contains { value })) => {
                Some(CompiledBody::RawContains(value.clone()))
            }
            (None, Some(RawBodyMatcher::Exact { value })) => {
                Some(CompiledBody::RawExact(value.clone()))
            }
            (None, Some(RawBodyMatcher::Empty)) => Some(CompiledBody::RawEmpty),
            (None, None) => None,
        };

        Ok(Self {
            method: matcher.method,
            path,
            headers,
            body,
        })
    }

    /// Rank used to choose between several matching stubs.
    pub fn specificity(&self) -> Specificity {
        if self.body.is_some() {
            return Specificity::Body;
        }
        match &self.path {
            Some(CompiledPath::Exact(_)) => Specificity::ExactPath,
            Some(_) => Specificity::PatternPath,
            None => Specificity::MethodOnly,
        }
    }

    /// Whether the request described by `ctx` satisfies every predicate.
    pub fn matches(&self, ctx: &MatchContext) -> bool {
        if !self.method.matches(&ctx.method) {
            return false;
        }

        if let Some(path) = &self.path {
            if !matches_path(path, &ctx.path) {
                return false;
            }
        }

        for (name, hm) in &self.headers {
            if !matches_header(ctx.headers.get(name), hm) {
                return false;
            }
        }

        match &self.body {
            Some(body) => matches_body(body, ctx),
            None => true,
        }
    }
}

/// Regexes are anchored: a pattern must cover the whole input.
fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| MockServerError::config(format!("invalid regex {:?}: {}", pattern, e)))
}

fn compile_path(path: &PathMatcher) -> Result<CompiledPath> {
    Ok(match path {
        PathMatcher::Exact { value } => CompiledPath::Exact(value.clone()),
        PathMatcher::Prefix { value } => CompiledPath::Prefix(value.clone()),
        PathMatcher::Regex { pattern } => CompiledPath::Regex(compile_regex(pattern)?),
        PathMatcher::Glob { pattern } => {
            let glob = globset::GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| MockServerError::config(format!("invalid glob: {}", e)))?;
            CompiledPath::Glob(glob.compile_matcher())
        }
    })
}

fn matches_path(matcher: &CompiledPath, path: &str) -> bool {
    match matcher {
        CompiledPath::Exact(value) => path == value,
        CompiledPath::Prefix(value) => path.starts_with(value.as_str()),
        CompiledPath::Regex(regex) => regex.is_match(path),
        CompiledPath::Glob(glob) => glob.is_match(path),
    }
}

fn matches_header(value: Option<&String>, matcher: &CompiledHeader) -> bool {
    match matcher {
        CompiledHeader::Exact(expected) => value == Some(expected),
        CompiledHeader::Regex(regex) => value.map(|v| regex.is_match(v)).unwrap_or(false),
        CompiledHeader::Present => value.is_some(),
        CompiledHeader::Absent => value.is_none(),
        CompiledHeader::Contains(expected) => {
            value.map(|v| v.contains(expected.as_str())).unwrap_or(false)
        }
    }
}

fn matches_body(matcher: &CompiledBody, ctx: &MatchContext) -> bool {
    match matcher {
        CompiledBody::EqualToJson { expected, options } => ctx
            .json
            .as_ref()
            .map(|actual| json_equals(expected, actual, *options))
            .unwrap_or(false),
        CompiledBody::JsonPath(expressions) => match &ctx.json {
            Some(json) => matches_json_paths(json, expressions),
            None => false,
        },
        CompiledBody::RawRegex(regex) => regex.is_match(&ctx.body),
        CompiledBody::RawContains(value) => ctx.body.contains(value.as_str()),
        CompiledBody::RawExact(value) => ctx.body == *value,
        CompiledBody::RawEmpty => ctx.body.is_empty(),
    }
}

fn matches_json_paths(json: &Value, expressions: &[(String, Value)]) -> bool {
    use jsonpath_rust::JsonPath;

    let strict = JsonCompare::default();
    for (path_expr, expected) in expressions {
        let path: JsonPath = match JsonPath::try_from(path_expr.as_str()) {
            Ok(p) => p,
            Err(_) => return false,
        };

        let results = path.find(json);
        if results == *expected {
            continue;
        }
        let found = match &results {
            Value::Array(values) => values.iter().any(|v| json_equals(expected, v, strict)),
            Value::Null => false,
            other => json_equals(expected, other, strict),
        };
        if !found {
            return false;
        }
    }
    true
}

/// Structural JSON equality.
///
/// Object key order never matters and numbers compare by value, so `0`
/// equals `0.0`. An expected `null` only matches a present `null`.
pub fn json_equals(expected: &Value, actual: &Value, options: JsonCompare) -> bool {
    match (expected, actual) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(expected), Value::Array(actual)) => {
            if options.ignore_array_order {
                let len_ok = if options.ignore_extra_elements {
                    expected.len() <= actual.len()
                } else {
                    expected.len() == actual.len()
                };
                len_ok
                    && assign_unordered(expected, actual, &mut vec![false; actual.len()], options)
            } else {
                expected.len() == actual.len()
                    && expected
                        .iter()
                        .zip(actual)
                        .all(|(e, a)| json_equals(e, a, options))
            }
        }
        (Value::Object(expected), Value::Object(actual)) => {
            if !options.ignore_extra_elements && expected.len() != actual.len() {
                return false;
            }
            expected.iter().all(|(key, e)| {
                actual
                    .get(key)
                    .map(|a| json_equals(e, a, options))
                    .unwrap_or(false)
            })
        }
        _ => false,
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Pair every expected element with a distinct actual element, backtracking
/// when a greedy choice leaves a later element without a partner.
fn assign_unordered(
    expected: &[Value],
    actual: &[Value],
    used: &mut [bool],
    options: JsonCompare,
) -> bool {
    let Some((first, rest)) = expected.split_first() else {
        return true;
    };
    for (i, candidate) in actual.iter().enumerate() {
        if used[i] || !json_equals(first, candidate, options) {
            continue;
        }
        used[i] = true;
        if assign_unordered(rest, actual, used, options) {
            return true;
        }
        used[i] = false;
    }
    false
}

/// Parse a query string into key-value pairs.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        if let Some((key, value)) = part.split_once('=') {
            params.insert(decode_component(key), decode_component(value));
        } else {
            params.insert(decode_component(part), String::new());
        }
    }

    params
}

fn decode_component(s: &str) -> String {
    decode(&s.replace('+', " "))
}

fn decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| s.to_string())
}
