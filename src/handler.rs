//! Per-request pipeline: parse, match, render, respond.

use crate::config::{GlobalSettings, ResponseBody, ResponseDefinition};
use crate::error::{MockServerError, Result};
use crate::journal::{RecordedRequest, RequestJournal};
use crate::matcher::MatchContext;
use crate::registry::{Stub, StubRegistry};
use crate::template::TemplateEngine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Header added to every response produced because no stub matched.
pub const NO_MATCH_HEADER: &str = "x-mock-no-match";

/// State shared by every connection of one server instance.
pub(crate) struct ServerState {
    pub registry: StubRegistry,
    pub journal: RequestJournal,
    pub templates: TemplateEngine,
    pub settings: GlobalSettings,
    pub default_response: Option<ResponseDefinition>,
}

/// Handle a request to the mock server.
///
/// Only an unreadable request body is an error; hyper then closes the
/// connection. Everything else becomes an HTTP response.
pub(crate) async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
    peer: SocketAddr,
) -> Result<Response<Full<Bytes>>> {
    let (parts, body) = req.into_parts();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(peer = %peer, error = %e, "Failed to read request body, closing connection");
            return Err(MockServerError::Transport {
                peer,
                message: e.to_string(),
            });
        }
    };

    let ctx = MatchContext::new(
        parts.method.as_str(),
        parts.uri.path(),
        parts.uri.query(),
        flatten_headers(&parts.headers),
        &body,
    );

    let selected = state.registry.select(&ctx);
    match &selected {
        Some(stub) if state.settings.log_matches => {
            info!(
                stub_id = %stub.id,
                method = %ctx.method,
                path = %ctx.path,
                "Request matched stub"
            );
        }
        None if state.settings.log_unmatched => {
            warn!(
                method = %ctx.method,
                path = %ctx.path,
                "No matching stub found"
            );
        }
        _ => {}
    }

    // Record before any delay or rendering.
    if state.settings.record_requests {
        let matched = selected.as_ref().map(|stub| stub.id.clone());
        state.journal.record(RecordedRequest::new(&ctx, matched));
    }

    let response = match selected {
        Some(stub) => stub_response(&state, &stub, &ctx).await,
        None => no_match_response(&state, &ctx),
    };

    Ok(response)
}

/// Collapse a header map to one value per name. Repeated headers are joined
/// with `, ` in arrival order.
fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    flat
}

async fn stub_response(
    state: &ServerState,
    stub: &Stub,
    ctx: &MatchContext,
) -> Response<Full<Bytes>> {
    if let Some(delay) = &stub.definition.delay {
        let delay_ms = delay.calculate();
        if delay_ms > 0 {
            debug!(stub_id = %stub.id, delay_ms, "Applying delay");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    let definition = &stub.definition.response;
    match render_body(state, definition, ctx) {
        Ok(body) => build_response(definition, body, &state.settings),
        Err(e) => {
            error!(stub_id = %stub.id, error = %e, "Failed to render stub response");
            let body = serde_json::json!({
                "error": "template_render_failed",
                "stub_id": stub.id,
                "message": e.to_string(),
            });
            json_response(StatusCode::INTERNAL_SERVER_ERROR, &body)
        }
    }
}

/// Produce the body bytes, rendering templates when enabled.
fn render_body(
    state: &ServerState,
    definition: &ResponseDefinition,
    ctx: &MatchContext,
) -> Result<Option<Vec<u8>>> {
    let Some(body) = &definition.body else {
        return Ok(None);
    };
    let templated = definition
        .template
        .unwrap_or(state.settings.global_templating);

    let bytes = match body {
        ResponseBody::Text { content } if templated => {
            state.templates.render(content, ctx)?.into_bytes()
        }
        ResponseBody::Json { content } if templated => {
            state.templates.render_json(content, ctx)?.to_string().into_bytes()
        }
        other => other.to_bytes()?,
    };
    Ok(Some(bytes))
}

fn no_match_response(state: &ServerState, ctx: &MatchContext) -> Response<Full<Bytes>> {
    let mut response = match &state.default_response {
        Some(default) => match render_body(state, default, ctx) {
            Ok(body) => build_response(default, body, &state.settings),
            Err(e) => {
                error!(error = %e, "Failed to render default response");
                json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &serde_json::json!({
                        "error": "template_render_failed",
                        "message": e.to_string(),
                    }),
                )
            }
        },
        None => json_response(
            StatusCode::NOT_FOUND,
            &serde_json::json!({
                "error": "no_matching_stub",
                "message": "No matching stub found",
                "method": ctx.method,
                "path": ctx.path,
            }),
        ),
    };
    response
        .headers_mut()
        .insert(HeaderName::from_static(NO_MATCH_HEADER), HeaderValue::from_static("true"));
    response
}

/// Assemble a response from a definition and its rendered body.
fn build_response(
    definition: &ResponseDefinition,
    body: Option<Vec<u8>>,
    settings: &GlobalSettings,
) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(definition.status).unwrap_or_else(|_| {
        warn!(status = definition.status, "Invalid status code, answering 500");
        StatusCode::INTERNAL_SERVER_ERROR
    });

    let content_type = match (&body, definition.content_type()) {
        (Some(_), None) => Some(
            definition
                .body
                .as_ref()
                .and_then(ResponseBody::content_type)
                .unwrap_or(settings.default_content_type.as_str()),
        ),
        _ => None,
    };

    let mut response = Response::new(Full::new(Bytes::from(body.unwrap_or_default())));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &definition.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid response header"),
        }
    }
    if let Some(content_type) = content_type {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
    }

    response
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RequestMatcher, StubDefinition};

    fn state() -> ServerState {
        ServerState {
            registry: StubRegistry::new(),
            journal: RequestJournal::new(),
            templates: TemplateEngine::new(),
            settings: GlobalSettings::default(),
            default_response: None,
        }
    }

    fn ctx(method: &str, path: &str) -> MatchContext {
        MatchContext::new(method, path, None, HashMap::new(), b"")
    }

    #[test]
    fn test_render_text_body() {
        let state = state();
        let definition =
            ResponseDefinition::with_status(200).text_body(r#"{"id":"{{request.path.[1]}}"}"#);
        let body = render_body(&state, &definition, &ctx("GET", "/books/12345")).unwrap();
        assert_eq!(body.unwrap(), br#"{"id":"12345"}"#);
    }

    #[test]
    fn test_repeated_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));
        headers.insert("accept", HeaderValue::from_static("application/json"));

        let flat = flatten_headers(&headers);
        assert_eq!(flat["x-tag"], "a, b");
        assert_eq!(flat["accept"], "application/json");
    }

    #[test]
    fn test_templating_can_be_disabled_per_response() {
        let state = state();
        let definition = ResponseDefinition::with_status(200)
            .text_body("{{request.path.[1]}}")
            .templated(false);
        let body = render_body(&state, &definition, &ctx("GET", "/books/1")).unwrap();
        assert_eq!(body.unwrap(), b"{{request.path.[1]}}");
    }

    #[test]
    fn test_build_response_keeps_header_order_and_infers_content_type() {
        let settings = GlobalSettings::default();
        let definition = ResponseDefinition::with_status(201)
            .header("X-First", "1")
            .header("X-Second", "2")
            .text_body("ok");
        let response = build_response(&definition, Some(b"ok".to_vec()), &settings);

        assert_eq!(response.status(), StatusCode::CREATED);
        let names: Vec<_> = response.headers().keys().map(|k| k.as_str().to_string()).collect();
        assert_eq!(names, vec!["x-first", "x-second", "content-type"]);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_build_response_without_body_has_no_content_type() {
        let settings = GlobalSettings::default();
        let response = build_response(&ResponseDefinition::with_status(204), None, &settings);
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_no_match_response_is_marked() {
        let state = state();
        let response = no_match_response(&state, &ctx("GET", "/missing"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[NO_MATCH_HEADER], "true");
    }

    #[test]
    fn test_configured_default_response() {
        let mut state = state();
        state.default_response = Some(ResponseDefinition::with_status(501).text_body("nope"));
        let response = no_match_response(&state, &ctx("GET", "/missing"));
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(response.headers()[NO_MATCH_HEADER], "true");
    }

    #[tokio::test]
    async fn test_render_failure_becomes_500() {
        let state = state();
        state
            .registry
            .register(
                StubDefinition::new(
                    RequestMatcher::get(),
                    ResponseDefinition::with_status(200).text_body("{{#each request.path}}"),
                )
                .with_id("broken"),
            )
            .unwrap();
        let ctx = ctx("GET", "/books/1");
        let stub = state.registry.select(&ctx).unwrap();

        let response = stub_response(&state, &stub, &ctx).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
