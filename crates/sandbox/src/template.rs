//! Embedded-expression template compilation.
//!
//! Template text compiles to a rhai script that appends literals and
//! interpolated expressions to an output string. Statement tags may open and
//! close blocks across literal runs, so `<% if cond { %> ... <% } %>` works
//! the way it reads.

use rhai::{Engine, Scope};
use segflow_core::{EngineError, SegflowResult};

use crate::value::to_dynamic;

pub(crate) fn render(
    engine: &Engine,
    source: &str,
    preamble: &str,
    vars: &[(&str, &serde_json::Value)],
) -> SegflowResult<String> {
    let script = compile(source, preamble)?;
    let mut scope = Scope::new();
    for (name, value) in vars {
        scope.push_dynamic(*name, to_dynamic(value)?);
    }
    engine
        .eval_with_scope::<String>(&mut scope, &script)
        .map_err(|e| EngineError::Sandbox(e.to_string()))
}

pub(crate) fn compile(source: &str, preamble: &str) -> SegflowResult<String> {
    let mut script = String::with_capacity(source.len() + preamble.len() + 64);
    script.push_str("let __out = \"\";\n");
    if !preamble.trim().is_empty() {
        script.push_str(preamble.trim());
        script.push('\n');
    }

    let mut rest = source;
    while let Some(start) = rest.find("<%") {
        let (literal, tail) = rest.split_at(start);
        push_literal(&mut script, literal);

        let tail = &tail[2..];
        let (interpolate, tail) = match tail.strip_prefix('=') {
            Some(stripped) => (true, stripped),
            None => (false, tail),
        };
        let end = tail
            .find("%>")
            .ok_or_else(|| EngineError::Sandbox("unterminated template tag".to_string()))?;
        let code = tail[..end].trim();
        if interpolate {
            script.push_str("__out += (");
            script.push_str(code);
            script.push_str(");\n");
        } else {
            script.push_str(code);
            script.push('\n');
        }
        rest = &tail[end + 2..];
    }
    push_literal(&mut script, rest);

    script.push_str("__out");
    Ok(script)
}

fn push_literal(script: &mut String, literal: &str) {
    if literal.is_empty() {
        return;
    }
    script.push_str("__out += \"");
    for ch in literal.chars() {
        match ch {
            '"' => script.push_str("\\\""),
            '\\' => script.push_str("\\\\"),
            '\n' => script.push_str("\\n"),
            '\r' => script.push_str("\\r"),
            '\t' => script.push_str("\\t"),
            _ => script.push(ch),
        }
    }
    script.push_str("\";\n");
}
