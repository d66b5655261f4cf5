//! Template engine for dynamic responses.
//!
//! Uses Handlebars with the request exposed under `request`, so a body such
//! as `{"id":"{{request.path.[1]}}"}` echoes the second path segment back.

use crate::matcher::MatchContext;
use handlebars::Handlebars;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::warn;

/// Template engine for rendering dynamic responses.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Root object handed to Handlebars.
#[derive(Debug, Serialize)]
struct TemplateContext<'a> {
    request: RequestView<'a>,
}

#[derive(Debug, Serialize)]
struct RequestView<'a> {
    method: &'a str,
    /// Path plus query string, as received
    url: String,
    /// Decoded path segments, addressed as `request.path.[N]`
    path: &'a [String],
    query: &'a HashMap<String, String>,
    headers: &'a HashMap<String, String>,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    json: Option<&'a serde_json::Value>,
}

impl<'a> TemplateContext<'a> {
    fn new(ctx: &'a MatchContext) -> Self {
        let url = match &ctx.query_string {
            Some(q) => format!("{}?{}", ctx.path, q),
            None => ctx.path.clone(),
        };
        Self {
            request: RequestView {
                method: &ctx.method,
                url,
                path: &ctx.segments,
                query: &ctx.query,
                headers: &ctx.headers,
                body: &ctx.body,
                json: ctx.json.as_ref(),
            },
        }
    }
}

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Response bodies are JSON or text, never HTML.
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render a template string against the request.
    ///
    /// Placeholders that resolve to nothing render as an empty string.
    pub fn render(
        &self,
        template: &str,
        ctx: &MatchContext,
    ) -> Result<String, handlebars::RenderError> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }
        warn_unresolved_segments(template, ctx);
        self.handlebars
            .render_template(template, &TemplateContext::new(ctx))
    }

    /// Render a JSON value with templates in string fields.
    pub fn render_json(
        &self,
        json: &serde_json::Value,
        ctx: &MatchContext,
    ) -> Result<serde_json::Value, handlebars::RenderError> {
        match json {
            serde_json::Value::String(s) => {
                if s.contains("{{") {
                    Ok(serde_json::Value::String(self.render(s, ctx)?))
                } else {
                    Ok(json.clone())
                }
            }
            serde_json::Value::Array(arr) => {
                let rendered: Result<Vec<_>, _> =
                    arr.iter().map(|v| self.render_json(v, ctx)).collect();
                Ok(serde_json::Value::Array(rendered?))
            }
            serde_json::Value::Object(obj) => {
                let mut rendered = serde_json::Map::new();
                for (k, v) in obj {
                    rendered.insert(k.clone(), self.render_json(v, ctx)?);
                }
                Ok(serde_json::Value::Object(rendered))
            }
            _ => Ok(json.clone()),
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn segment_placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*request\.path\.\[(\d+)\]\s*\}\}").expect("static regex is valid")
    })
}

fn warn_unresolved_segments(template: &str, ctx: &MatchContext) {
    for captures in segment_placeholder().captures_iter(template) {
        let in_range = captures[1]
            .parse::<usize>()
            .map(|index| index < ctx.segments.len())
            .unwrap_or(false);
        if !in_range {
            warn!(
                placeholder = &captures[0],
                path = %ctx.path,
                segments = ctx.segments.len(),
                "Path segment placeholder out of range, rendering empty"
            );
        }
    }
}

// Custom Handlebars helpers

fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| v.value());
    let default = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    match value {
        Some(v) if !v.is_null() => {
            if let Some(s) = v.as_str() {
                if !s.is_empty() {
                    out.write(s)?;
                    return Ok(());
                }
            } else {
                out.write(&v.to_string())?;
                return Ok(());
            }
        }
        _ => {}
    }

    out.write(default)?;
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_lowercase())?;
    Ok(())
}
