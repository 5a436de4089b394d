// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! TypeScript binding generation.
//!
//! For every bridged tool this emits an input type, an output type, and an
//! async function that POSTs to the bridge, all derived from the tool's JSON
//! Schemas.  The bindings concatenate into a preamble prepended to whatever
//! script the model writes, so the model calls `await get_weather({...})`
//! against real types instead of inventing a protocol.

use serde_json::Value;

use quill_mcp::ToolDescriptor;
use quill_model::{GenError, Result};

/// Produce the full preamble for `tools` against a bridge on `port`.
///
/// Tool names are sanitized into TypeScript identifiers; two tools that
/// sanitize to the same identifier are a configuration error surfaced here,
/// at construction.
pub fn generate_preamble(tools: &[ToolDescriptor], port: u16) -> Result<String> {
    let mut seen: std::collections::HashMap<String, String> = std::collections::HashMap::new();

    let mut out = String::with_capacity(2048);
    out.push_str(&header(port));

    for tool in tools {
        let ident = sanitize_identifier(&tool.name);
        if let Some(existing) = seen.insert(ident.clone(), tool.name.clone()) {
            return Err(GenError::Config(format!(
                "tool name collision: {:?} and {:?} both bind as `{ident}`",
                existing, tool.name
            )));
        }
        out.push_str(&binding(tool, &ident));
    }
    Ok(out)
}

fn header(port: u16) -> String {
    format!(
        r#"// Generated tool bindings. Every call is proxied to the local bridge.
type Result<T> = {{ value: T; error?: undefined }} | {{ value?: undefined; error: string }};

async function __call<T>(toolName: string, args: unknown): Promise<Result<T>> {{
  const resp = await fetch("http://127.0.0.1:{port}/", {{
    method: "POST",
    headers: {{ "content-type": "application/json" }},
    body: JSON.stringify({{ tool_name: toolName, arguments: args }}),
  }});
  const body = await resp.json();
  if (body.is_error) {{
    return {{ error: typeof body.content === "string" ? body.content : JSON.stringify(body.content) }};
  }}
  return {{ value: body.content as T }};
}}
"#
    )
}

fn binding(tool: &ToolDescriptor, ident: &str) -> String {
    let pascal = pascal_case(ident);
    let input_ty = ts_type(&tool.input_schema, 0);
    let output_ty = tool
        .output_schema
        .as_ref()
        .map(|s| ts_type(s, 0))
        .unwrap_or_else(|| "unknown".to_string());
    let doc = if tool.description.is_empty() {
        String::new()
    } else {
        format!("/** {} */\n", tool.description.replace("*/", "*\\/"))
    };
    format!(
        "\nexport type {pascal}Input = {input_ty};\nexport type {pascal}Output = {output_ty};\n{doc}export async function {ident}(input: {pascal}Input): Promise<Result<{pascal}Output>> {{\n  return await __call<{pascal}Output>({name:?}, input);\n}}\n",
        name = tool.name,
    )
}

/// Render a JSON Schema fragment as a TypeScript type.
fn ts_type(schema: &Value, depth: usize) -> String {
    // Recursion guard for pathological self-nested schemas.
    if depth > 16 {
        return "unknown".into();
    }
    let Some(obj) = schema.as_object() else { return "unknown".into() };

    if let Some(values) = obj.get("enum").and_then(|e| e.as_array()) {
        let variants: Vec<String> = values.iter().map(literal).collect();
        return if variants.is_empty() { "unknown".into() } else { variants.join(" | ") };
    }
    for key in ["oneOf", "anyOf"] {
        if let Some(options) = obj.get(key).and_then(|o| o.as_array()) {
            let variants: Vec<String> =
                options.iter().map(|o| ts_type(o, depth + 1)).collect();
            return if variants.is_empty() { "unknown".into() } else { variants.join(" | ") };
        }
    }

    match obj.get("type").and_then(|t| t.as_str()) {
        Some("string") => "string".into(),
        Some("number") | Some("integer") => "number".into(),
        Some("boolean") => "boolean".into(),
        Some("null") => "null".into(),
        Some("array") => {
            let item = obj.get("items").map(|i| ts_type(i, depth + 1)).unwrap_or("unknown".into());
            format!("Array<{item}>")
        }
        Some("object") | None => object_type(obj, depth),
        Some(_) => "unknown".into(),
    }
}

fn object_type(obj: &serde_json::Map<String, Value>, depth: usize) -> String {
    let Some(props) = obj.get("properties").and_then(|p| p.as_object()) else {
        return "Record<string, unknown>".into();
    };
    let required: Vec<&str> = obj
        .get("required")
        .and_then(|r| r.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    let mut fields: Vec<String> = Vec::new();
    for (name, prop) in props {
        let opt = if required.contains(&name.as_str()) { "" } else { "?" };
        let ty = ts_type(prop, depth + 1);
        // Quote keys that are not valid identifiers.
        let key = if is_identifier(name) { name.clone() } else { format!("{name:?}") };
        fields.push(format!("{key}{opt}: {ty}"));
    }
    if fields.is_empty() {
        "Record<string, unknown>".into()
    } else {
        format!("{{ {} }}", fields.join("; "))
    }
}

fn literal(v: &Value) -> String {
    match v {
        Value::String(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Make a tool name usable as a TypeScript identifier.
pub fn sanitize_identifier(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.chars().next().is_none_or(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn pascal_case(ident: &str) -> String {
    ident
        .split('_')
        .filter(|s| !s.is_empty())
        .map(|s| {
            let mut chars = s.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
