//! Stub Mock Server
//!
//! A stub-driven HTTP mock server for integration tests. Stubs pair a request
//! pattern with a response template; the server binds an OS-assigned port,
//! picks the most specific matching stub for every request and renders its
//! response, optionally echoing parts of the request back.
//!
//! # Features
//!
//! - **Request Matching**: Match by method, path (exact, prefix, regex, glob),
//!   headers, and body (structural JSON, JSONPath, raw text)
//! - **Specificity Selection**: Body predicates beat exact paths, which beat
//!   path patterns, which beat method-only stubs; ties go to the newest stub
//! - **Dynamic Templates**: Handlebars bodies such as `{{request.path.[1]}}`
//! - **Verification**: Count received requests matching a pattern
//! - **Latency Simulation**: Add fixed or random delays
//!
//! # Example
//!
//! ```no_run
//! use stub_mock_server::{MockServer, RequestMatcher, ResponseDefinition, StubDefinition};
//!
//! # async fn run() -> stub_mock_server::Result<()> {
//! let server = MockServer::default();
//! server.register(StubDefinition::new(
//!     RequestMatcher::get().path_regex("/books/[^/]+"),
//!     ResponseDefinition::with_status(200)
//!         .header("Content-Type", "application/json")
//!         .text_body(r#"{"id":"{{request.path.[1]}}"}"#),
//! ))?;
//!
//! let base_url = server.start().await?;
//! // GET {base_url}/books/42 -> {"id":"42"}
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
mod handler;
pub mod journal;
pub mod matcher;
pub mod registry;
pub mod server;
pub mod template;

pub use config::{
    DelayConfig, GlobalSettings, HeaderMatcher, HttpMethod, JsonBodyMatcher, MockServerConfig,
    PathMatcher, RawBodyMatcher, RequestMatcher, ResponseBody, ResponseDefinition, StubDefinition,
};
pub use error::{MockServerError, Result};
pub use handler::NO_MATCH_HEADER;
pub use journal::RecordedRequest;
pub use server::MockServer;
