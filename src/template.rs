//! Template engine for dynamic responses.
//!
//! A response specification is serialized to JSON text, expanded with
//! Handlebars against the [`RequestContext`], and parsed back into a JSON
//! value. Expressions can therefore appear anywhere in the document,
//! including block helpers that span several fields.
//!
//! Expanded values are escaped as JSON string content rather than HTML, so
//! a parameter containing a quote stays inside its string literal.

use chrono::Utc;
use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext,
    RenderErrorReason,
};
use rand::Rng;
use serde_json::Value;
use std::borrow::Cow;
use std::fmt::Write as _;
use tracing::debug;

use crate::context::RequestContext;
use crate::events::{timestamp, EventBus};

/// Errors produced while rendering a response.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The template could not be compiled or evaluated
    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),

    /// The expanded text is not valid JSON
    #[error("JSON parse error after template rendering: {source}")]
    Parse {
        source: serde_json::Error,
        rendered: String,
    },
}

impl RenderError {
    /// The offending rendered text, if rendering got that far.
    pub fn rendered(&self) -> Option<&str> {
        match self {
            RenderError::Parse { rendered, .. } => Some(rendered),
            RenderError::Template(_) => None,
        }
    }
}

/// Template engine for rendering dynamic responses.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
    events: EventBus,
}

impl TemplateEngine {
    /// Create a new template engine reporting warnings to `events`.
    pub fn new(events: EventBus) -> Self {
        let mut handlebars = Handlebars::new();

        let helpers: [(&str, StringHelper); 7] = [
            ("uuid", StringHelper(uuid_value)),
            ("now", StringHelper(now_value)),
            ("random", StringHelper(random_value)),
            ("default", StringHelper(default_value)),
            ("upper", StringHelper(upper_value)),
            ("lower", StringHelper(lower_value)),
            ("json", StringHelper(json_value)),
        ];
        for (name, helper) in helpers {
            handlebars.register_helper(name, Box::new(helper));
        }

        handlebars.register_escape_fn(escape_json_string);

        Self { handlebars, events }
    }

    /// Render a response specification against a request context.
    ///
    /// A missing specification renders to `{}`.
    pub fn render(
        &self,
        response: Option<&Value>,
        ctx: &RequestContext,
    ) -> Result<Value, RenderError> {
        let Some(response) = response else {
            self.events.warn("No response defined, returning empty object");
            return Ok(Value::Object(serde_json::Map::new()));
        };

        let source = template_source(response);
        let text = source.to_string();
        if !text.contains("{{") {
            return Ok(source.clone());
        }

        let template = unescape_expressions(&text);
        debug!(preview = %preview(&template), "Rendering response template");

        let rendered = self.handlebars.render_template(&template, ctx)?;
        serde_json::from_str(&rendered).map_err(|source| RenderError::Parse { source, rendered })
    }
}

/// Select the template source of a response specification.
///
/// `{ template: X }` and `X` are equivalent.
fn template_source(response: &Value) -> &Value {
    match response.get("template") {
        Some(template) if !template.is_null() => template,
        _ => response,
    }
}

/// Undo JSON string escaping inside `{{ ... }}` expressions.
///
/// Serializing `{{default query.name "anon"}}` into a JSON string escapes
/// the helper's quotes; Handlebars needs them back.
fn unescape_expressions(text: &str) -> Cow<'_, str> {
    if !text.contains('\\') {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find("}}") else {
            rest = tail;
            break;
        };

        let mut chars = tail[..end].chars().peekable();
        while let Some(ch) = chars.next() {
            match (ch, chars.peek()) {
                ('\\', Some(&next)) if next == '"' || next == '\\' => {
                    out.push(next);
                    chars.next();
                }
                _ => out.push(ch),
            }
        }
        rest = &tail[end..];
    }
    out.push_str(rest);

    Cow::Owned(out)
}

/// Escape text as the content of a JSON string literal.
fn escape_json_string(data: &str) -> String {
    let quoted = Value::from(data).to_string();
    quoted
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(&quoted)
        .to_string()
}

fn preview(template: &str) -> String {
    template.chars().take(100).collect()
}

// Custom Handlebars helpers

/// A helper that produces one string, written as JSON string content.
struct StringHelper(fn(&Helper<'_>) -> Result<String, RenderErrorReason>);

impl HelperDef for StringHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let value = (self.0)(h)?;
        out.write(&escape_json_string(&value))?;
        Ok(())
    }
}

fn str_param<'a>(h: &'a Helper<'_>, index: usize) -> Option<&'a str> {
    h.param(index).and_then(|v| v.value().as_str())
}

fn int_param(h: &Helper<'_>, index: usize) -> Option<i64> {
    h.param(index).and_then(|v| v.value().as_i64())
}

/// Random version 4 UUID.
fn uuid_value(_: &Helper<'_>) -> Result<String, RenderErrorReason> {
    let mut bytes: [u8; 16] = rand::thread_rng().gen();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &hex[..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..]
    ))
}

/// Current UTC time, RFC 3339 by default or a strftime `format`.
fn now_value(h: &Helper<'_>) -> Result<String, RenderErrorReason> {
    let Some(format) = str_param(h, 0) else {
        return Ok(timestamp());
    };

    let mut text = String::new();
    write!(text, "{}", Utc::now().format(format))
        .map_err(|_| RenderErrorReason::Other(format!("invalid now format: {format}")))?;
    Ok(text)
}

/// Integer in `[min, max]`, bounds default to 0 and 100 and may be reversed.
fn random_value(h: &Helper<'_>) -> Result<String, RenderErrorReason> {
    let a = int_param(h, 0).unwrap_or(0);
    let b = int_param(h, 1).unwrap_or(100);
    let value = rand::thread_rng().gen_range(a.min(b)..=a.max(b));
    Ok(value.to_string())
}

/// `value` unless it is missing, null or empty, else `fallback`.
fn default_value(h: &Helper<'_>) -> Result<String, RenderErrorReason> {
    let fallback = str_param(h, 1).unwrap_or("");
    Ok(match h.param(0).map(|v| v.value()) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::String(_)) | Some(Value::Null) | None => fallback.to_string(),
        Some(v) => v.to_string(),
    })
}

fn upper_value(h: &Helper<'_>) -> Result<String, RenderErrorReason> {
    Ok(str_param(h, 0).unwrap_or("").to_uppercase())
}

fn lower_value(h: &Helper<'_>) -> Result<String, RenderErrorReason> {
    Ok(str_param(h, 0).unwrap_or("").to_lowercase())
}

/// Any context value (e.g. `{{json body}}`) as compact JSON text.
fn json_value(h: &Helper<'_>) -> Result<String, RenderErrorReason> {
    Ok(h.param(0).map(|v| v.value().to_string()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LogLevel, MockEvent};
    use serde_json::json;

    fn engine() -> TemplateEngine {
        TemplateEngine::new(EventBus::new())
    }

    fn context(params: &[(&str, &str)], query: Option<&str>, body: Value) -> RequestContext {
        let params: Vec<_> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RequestContext::new(&params, query, body)
    }

    #[test]
    fn test_path_param() {
        let ctx = context(&[("id", "42")], None, json!({}));
        let response = json!({ "id": "{{params.id}}", "name": "User {{params.id}}" });

        let result = engine().render(Some(&response), &ctx).unwrap();
        assert_eq!(result, json!({ "id": "42", "name": "User 42" }));
    }

    #[test]
    fn test_query_and_body() {
        let ctx = context(&[], Some("page=3"), json!({ "user": { "name": "John" } }));
        let response = json!({
            "page": "{{query.page}}",
            "greeting": "Hello {{body.user.name}}"
        });

        let result = engine().render(Some(&response), &ctx).unwrap();
        assert_eq!(result["page"], "3");
        assert_eq!(result["greeting"], "Hello John");
    }

    #[test]
    fn test_static_response_is_unchanged() {
        let ctx = context(&[], None, json!({}));
        let response = json!({ "items": [1, 2, 3], "ok": true, "nested": { "k": null } });

        let result = engine().render(Some(&response), &ctx).unwrap();
        assert_eq!(result, response);
    }

    #[test]
    fn test_template_wrapper_is_equivalent() {
        let ctx = context(&[("id", "7")], None, json!({}));
        let inline = json!({ "id": "{{params.id}}", "tags": ["a", "{{params.id}}"] });
        let wrapped = json!({ "template": inline.clone() });

        let engine = engine();
        let a = engine.render(Some(&inline), &ctx).unwrap();
        let b = engine.render(Some(&wrapped), &ctx).unwrap();
        assert_eq!(a, b);
        assert_eq!(a["tags"][1], "7");
    }

    #[tokio::test]
    async fn test_missing_response_renders_empty_object() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let engine = TemplateEngine::new(events);
        let ctx = context(&[], None, json!({}));

        let result = engine.render(None, &ctx).unwrap();
        assert_eq!(result, json!({}));

        match rx.recv().await.unwrap() {
            MockEvent::Log { level, .. } => assert_eq!(level, LogLevel::Warn),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_context_tokens() {
        let ctx = context(&[], None, json!({}));
        let response = json!({ "at": "{{now}}", "token": "{{randomId}}" });

        let result = engine().render(Some(&response), &ctx).unwrap();
        assert!(result["at"].as_str().unwrap().ends_with('Z'));
        let token: u32 = result["token"].as_str().unwrap().parse().unwrap();
        assert!(token < 10_000);
    }

    #[test]
    fn test_values_are_json_escaped() {
        let ctx = context(&[("name", r#"say "hi"\now"#)], None, json!({}));
        let response = json!({ "name": "{{params.name}}", "loud": "{{upper params.name}}" });

        let result = engine().render(Some(&response), &ctx).unwrap();
        assert_eq!(result["name"], r#"say "hi"\now"#);
        assert_eq!(result["loud"], r#"SAY "HI"\NOW"#);
    }

    #[test]
    fn test_helper_string_arguments() {
        let ctx = context(&[], Some("name=ann"), json!({}));
        let response = json!({
            "who": "{{default query.name \"anonymous\"}}",
            "missing": "{{default query.other \"anonymous\"}}"
        });

        let result = engine().render(Some(&response), &ctx).unwrap();
        assert_eq!(result["who"], "ann");
        assert_eq!(result["missing"], "anonymous");
    }

    #[test]
    fn test_block_helpers() {
        let ctx = context(&[], None, json!({ "items": ["a", "b"], "admin": true }));
        let response = json!({
            "role": "{{#if body.admin}}admin{{else}}user{{/if}}",
            "list": "{{#each body.items}}{{this}};{{/each}}"
        });

        let result = engine().render(Some(&response), &ctx).unwrap();
        assert_eq!(result["role"], "admin");
        assert_eq!(result["list"], "a;b;");
    }

    #[test]
    fn test_uuid_and_random_helpers() {
        let ctx = context(&[], None, json!({}));
        let response = json!({ "id": "{{uuid}}", "n": "{{random 5 1}}" });

        let result = engine().render(Some(&response), &ctx).unwrap();
        let uuid = result["id"].as_str().unwrap();
        assert_eq!(uuid.len(), 36);
        assert_eq!(uuid.chars().nth(14), Some('4'));

        let n: i64 = result["n"].as_str().unwrap().parse().unwrap();
        assert!((1..=5).contains(&n));
    }

    #[test]
    fn test_json_helper() {
        let ctx = context(&[], None, json!({ "a": [1, 2] }));
        let response = json!({ "echo": "{{json body}}" });

        let result = engine().render(Some(&response), &ctx).unwrap();
        let echoed: Value = serde_json::from_str(result["echo"].as_str().unwrap()).unwrap();
        assert_eq!(echoed, json!({ "a": [1, 2] }));
    }

    #[test]
    fn test_missing_values_render_empty() {
        let ctx = context(&[], None, json!({}));
        let response = json!({ "x": "[{{params.nope}}]" });

        let result = engine().render(Some(&response), &ctx).unwrap();
        assert_eq!(result["x"], "[]");
    }

    #[test]
    fn test_parse_failure_carries_rendered_text() {
        let ctx = context(&[], None, json!({ "raw": "a\"b" }));
        let response = json!({ "x": "{{{body.raw}}}" });

        let err = engine().render(Some(&response), &ctx).unwrap_err();
        assert!(matches!(err, RenderError::Parse { .. }));
        assert_eq!(err.rendered(), Some(r#"{"x":"a"b"}"#));
        assert!(err.to_string().starts_with("JSON parse error after template rendering"));
    }

    #[test]
    fn test_template_syntax_error() {
        let ctx = context(&[], None, json!({}));
        let response = json!({ "x": "{{#if params.id}}unterminated" });

        let err = engine().render(Some(&response), &ctx).unwrap_err();
        assert!(matches!(err, RenderError::Template(_)));
        assert!(err.rendered().is_none());
    }

    #[test]
    fn test_now_with_format() {
        let ctx = context(&[], None, json!({}));
        let response = json!({ "year": "{{now \"%Y\"}}" });

        let result = engine().render(Some(&response), &ctx).unwrap();
        let year = result["year"].as_str().unwrap();
        assert_eq!(year.len(), 4);
        assert!(year.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_invalid_now_format_is_render_error() {
        let ctx = context(&[], None, json!({}));
        let response = json!({ "at": "{{now \"%Q\"}}" });

        let err = engine().render(Some(&response), &ctx).unwrap_err();
        assert!(matches!(err, RenderError::Template(_)));
        assert!(err.to_string().contains("invalid now format"));
    }

    #[test]
    fn test_unescape_expressions() {
        assert_eq!(
            unescape_expressions(r#"{"a":"{{default x \"y\"}}","b":"\"q\""}"#),
            r#"{"a":"{{default x "y"}}","b":"\"q\""}"#
        );
        assert_eq!(unescape_expressions("no escapes"), "no escapes");
    }

    #[test]
    fn test_escape_json_string() {
        assert_eq!(escape_json_string("plain"), "plain");
        assert_eq!(escape_json_string("a\"b\\c\n"), r#"a\"b\\c\n"#);
    }
}
