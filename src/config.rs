//! Configuration for the mock server.
//!
//! Defines request patterns, response templates, stubs and server settings.
//! Every type deserializes from YAML and can also be assembled in code with
//! the builder-style constructors, which is how test setup usually declares
//! its stubs.

use crate::error::{MockServerError, Result};
use crate::matcher::CompiledMatcher;
use hyper::header::{HeaderName, HeaderValue};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main configuration for the mock server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockServerConfig {
    /// List of stub definitions, registered in order
    #[serde(default)]
    pub stubs: Vec<StubDefinition>,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,

    /// Response used when no stub matches
    #[serde(default)]
    pub default_response: Option<ResponseDefinition>,
}

impl MockServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        for (i, stub) in self.stubs.iter().enumerate() {
            stub.validate().map_err(|e| {
                MockServerError::config(format!("stub {} ({}): {}", i, stub.label(), e))
            })?;
        }
        if let Some(default) = &self.default_response {
            default.validate()?;
        }
        Ok(())
    }
}

/// A single stub definition: a request pattern paired with a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StubDefinition {
    /// Identifier used in logs and the request journal. Assigned by the
    /// registry when absent.
    #[serde(default)]
    pub id: Option<String>,

    /// Request pattern
    pub request: RequestMatcher,

    /// Response to return
    pub response: ResponseDefinition,

    /// Latency simulation
    #[serde(default)]
    pub delay: Option<DelayConfig>,
}

impl StubDefinition {
    /// Pair a request pattern with a response.
    pub fn new(request: RequestMatcher, response: ResponseDefinition) -> Self {
        Self {
            id: None,
            request,
            response,
            delay: None,
        }
    }

    /// Set the stub identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Delay the response.
    pub fn with_delay(mut self, delay: DelayConfig) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Validate the stub definition.
    pub fn validate(&self) -> Result<()> {
        if matches!(&self.id, Some(id) if id.is_empty()) {
            return Err(MockServerError::config("stub id cannot be empty"));
        }
        self.request.validate()?;
        self.response.validate()?;
        Ok(())
    }

    fn label(&self) -> &str {
        self.id.as_deref().unwrap_or("<unnamed>")
    }
}

/// HTTP method constraint of a request pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    /// Matches every method
    #[default]
    Any,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Any => "ANY",
        }
    }

    /// Whether a request with the given method satisfies this constraint.
    pub fn matches(&self, method: &str) -> bool {
        match self {
            HttpMethod::Any => true,
            other => other.as_str().eq_ignore_ascii_case(method),
        }
    }
}

/// Request matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RequestMatcher {
    /// HTTP method to match
    #[serde(default)]
    pub method: HttpMethod,

    /// Path matching
    #[serde(default)]
    pub path: Option<PathMatcher>,

    /// Header matching
    #[serde(default)]
    pub headers: HashMap<String, HeaderMatcher>,

    /// Structural body matching over the parsed JSON body
    #[serde(default)]
    pub body: Option<JsonBodyMatcher>,

    /// Matching over the raw, unparsed body text
    #[serde(default)]
    pub raw_body: Option<RawBodyMatcher>,
}

impl RequestMatcher {
    /// Match requests with the given method and any path.
    pub fn method(method: HttpMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    /// Match every request.
    pub fn any() -> Self {
        Self::method(HttpMethod::Any)
    }

    pub fn get() -> Self {
        Self::method(HttpMethod::Get)
    }

    pub fn post() -> Self {
        Self::method(HttpMethod::Post)
    }

    pub fn put() -> Self {
        Self::method(HttpMethod::Put)
    }

    pub fn delete() -> Self {
        Self::method(HttpMethod::Delete)
    }

    pub fn patch() -> Self {
        Self::method(HttpMethod::Patch)
    }

    /// Require the decoded path to equal `value`.
    pub fn path_exact(mut self, value: impl Into<String>) -> Self {
        self.path = Some(PathMatcher::Exact {
            value: value.into(),
        });
        self
    }

    /// Require the decoded path to start with `value`.
    pub fn path_prefix(mut self, value: impl Into<String>) -> Self {
        self.path = Some(PathMatcher::Prefix {
            value: value.into(),
        });
        self
    }

    /// Require the whole decoded path to match a regex.
    pub fn path_regex(mut self, pattern: impl Into<String>) -> Self {
        self.path = Some(PathMatcher::Regex {
            pattern: pattern.into(),
        });
        self
    }

    /// Require the decoded path to match a glob; `*` does not cross `/`.
    pub fn path_glob(mut self, pattern: impl Into<String>) -> Self {
        self.path = Some(PathMatcher::Glob {
            pattern: pattern.into(),
        });
        self
    }

    /// Add a header predicate.
    pub fn header(mut self, name: impl Into<String>, matcher: HeaderMatcher) -> Self {
        self.headers.insert(name.into(), matcher);
        self
    }

    /// Require a JSON body structurally equal to `value`, ignoring array order
    /// and rejecting extra fields.
    pub fn body_json(self, value: serde_json::Value) -> Self {
        self.body_json_with(value, true, false)
    }

    /// Require a JSON body structurally equal to `value` with explicit options.
    pub fn body_json_with(
        mut self,
        value: serde_json::Value,
        ignore_array_order: bool,
        ignore_extra_elements: bool,
    ) -> Self {
        self.body = Some(JsonBodyMatcher::EqualToJson {
            value,
            ignore_array_order,
            ignore_extra_elements,
        });
        self
    }

    /// Require a JSONPath expression to evaluate to `expected`.
    pub fn body_json_path(
        mut self,
        expression: impl Into<String>,
        expected: serde_json::Value,
    ) -> Self {
        match &mut self.body {
            Some(JsonBodyMatcher::JsonPath { expressions }) => {
                expressions.insert(expression.into(), expected);
            }
            _ => {
                let mut expressions = HashMap::new();
                expressions.insert(expression.into(), expected);
                self.body = Some(JsonBodyMatcher::JsonPath { expressions });
            }
        }
        self
    }

    /// Require the whole raw body to match a regex.
    pub fn body_matching(mut self, pattern: impl Into<String>) -> Self {
        self.raw_body = Some(RawBodyMatcher::Regex {
            pattern: pattern.into(),
        });
        self
    }

    /// Require the raw body to contain `value`.
    pub fn body_contains(mut self, value: impl Into<String>) -> Self {
        self.raw_body = Some(RawBodyMatcher::Contains {
            value: value.into(),
        });
        self
    }

    /// Validate the request matcher by compiling it.
    pub fn validate(&self) -> Result<()> {
        CompiledMatcher::compile(self).map(drop)
    }
}

/// Path matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathMatcher {
    /// Exact path match
    Exact { value: String },
    /// Path prefix match
    Prefix { value: String },
    /// Regex pattern, matched against the whole path
    Regex { pattern: String },
    /// Glob pattern match
    Glob { pattern: String },
}

/// Header matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeaderMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Header must be present (any value)
    Present,
    /// Header must be absent
    Absent,
    /// Value must contain substring
    Contains { value: String },
}

/// Predicates over the parsed JSON body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JsonBodyMatcher {
    /// Structural equality with an expected document
    EqualToJson {
        value: serde_json::Value,
        #[serde(default = "default_true")]
        ignore_array_order: bool,
        #[serde(default)]
        ignore_extra_elements: bool,
    },
    /// JSON path matching
    JsonPath {
        /// JSON path expressions and expected values
        expressions: HashMap<String, serde_json::Value>,
    },
}

/// Predicates over the raw body text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawBodyMatcher {
    /// Regex matched against the whole body
    Regex { pattern: String },
    /// Body must contain substring
    Contains { value: String },
    /// Exact body match
    Exact { value: String },
    /// Body must be empty
    Empty,
}

fn default_true() -> bool {
    true
}

/// Response definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers, written in declaration order
    #[serde(default)]
    pub headers: IndexMap<String, String>,

    /// Response body
    #[serde(default)]
    pub body: Option<ResponseBody>,

    /// Render the body as a template. Falls back to
    /// [`GlobalSettings::global_templating`] when unset.
    #[serde(default)]
    pub template: Option<bool>,
}

fn default_status() -> u16 {
    200
}

impl Default for ResponseDefinition {
    fn default() -> Self {
        Self::with_status(default_status())
    }
}

impl ResponseDefinition {
    /// Empty response with the given status.
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            headers: IndexMap::new(),
            body: None,
            template: None,
        }
    }

    /// Append a response header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Use a text body (which may contain template placeholders).
    pub fn text_body(mut self, content: impl Into<String>) -> Self {
        self.body = Some(ResponseBody::Text {
            content: content.into(),
        });
        self
    }

    /// Use a JSON body; string leaves may contain template placeholders.
    pub fn json_body(mut self, content: serde_json::Value) -> Self {
        self.body = Some(ResponseBody::Json { content });
        self
    }

    /// Force templating on or off for this response.
    pub fn templated(mut self, enabled: bool) -> Self {
        self.template = Some(enabled);
        self
    }

    /// Validate the response definition.
    pub fn validate(&self) -> Result<()> {
        if self.status < 100 || self.status > 599 {
            return Err(MockServerError::config(format!(
                "invalid status code: {}",
                self.status
            )));
        }
        for (name, value) in &self.headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| MockServerError::config(format!("invalid header name: {:?}", name)))?;
            HeaderValue::from_str(value).map_err(|_| {
                MockServerError::config(format!("invalid value for header {}: {:?}", name, value))
            })?;
        }
        if let Some(body @ ResponseBody::Base64 { .. }) = &self.body {
            body.to_bytes()?;
        }
        Ok(())
    }

    /// The explicitly configured `Content-Type`, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.as_str())
    }
}

/// Response body configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: serde_json::Value },
    /// Base64 encoded binary
    Base64 { content: String },
}

impl ResponseBody {
    /// Get the body content as bytes, without template rendering.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            ResponseBody::Text { content } => Ok(content.as_bytes().to_vec()),
            ResponseBody::Json { content } => serde_json::to_vec(content)
                .map_err(|e| MockServerError::config(format!("unserializable JSON body: {}", e))),
            ResponseBody::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| MockServerError::config(format!("invalid base64 body: {}", e)))
            }
        }
    }

    /// Content type implied by the body kind, if it has one of its own.
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            ResponseBody::Text { .. } => None,
            ResponseBody::Json { .. } => Some("application/json"),
            ResponseBody::Base64 { .. } => Some("application/octet-stream"),
        }
    }
}

/// Delay/latency simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DelayConfig {
    /// Fixed delay in milliseconds
    #[serde(default)]
    pub fixed_ms: u64,

    /// Minimum delay for random range (ms)
    #[serde(default)]
    pub min_ms: u64,

    /// Maximum delay for random range (ms)
    #[serde(default)]
    pub max_ms: u64,
}

impl DelayConfig {
    /// Calculate the actual delay to apply.
    pub fn calculate(&self) -> u64 {
        if self.fixed_ms > 0 {
            return self.fixed_ms;
        }
        if self.max_ms > self.min_ms {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            return rng.gen_range(self.min_ms..=self.max_ms);
        }
        self.min_ms
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind (0 = OS-assigned)
    #[serde(default)]
    pub port: u16,

    /// How long `stop()` waits for in-flight requests before closing them
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Render every response body as a template unless the stub opts out
    #[serde(default = "default_true")]
    pub global_templating: bool,

    /// Keep a journal of received requests for verification
    #[serde(default = "default_true")]
    pub record_requests: bool,

    /// Log all matched stubs
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Content type for text bodies without an explicit header
    #[serde(default = "default_content_type")]
    pub default_content_type: String,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            grace_period_ms: default_grace_period_ms(),
            global_templating: true,
            record_requests: true,
            log_matches: true,
            log_unmatched: true,
            default_content_type: default_content_type(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_grace_period_ms() -> u64 {
    2000
}

fn default_content_type() -> String {
    "application/json".to_string()
}
