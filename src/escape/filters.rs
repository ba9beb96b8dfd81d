//! Sanitising functions appended to action pipelines by [`super::HtmlEscaper`]
//!
//! Their names start with an underscore and are resolved before any custom or
//! builtin function, so a user function can never replace one.

use serde_json::Value;

use super::context::{attr_kind, AttrKind};
use crate::exec::BuiltinFn;

pub const HTML: &str = "_html_escape";
pub const ATTR: &str = "_attr_escape";
pub const ATTR_UNQUOTED: &str = "_attr_unquoted_escape";
pub const ATTR_NAME: &str = "_attr_name_filter";
pub const URL_FILTER: &str = "_url_filter";
pub const URL_NORMALIZE: &str = "_url_normalize";
pub const URL_QUERY: &str = "_url_query_escape";
pub const JS_VALUE: &str = "_js_value";
pub const CSS: &str = "_css_filter";

/// Replacement for values rejected in their context
pub const FILTERED: &str = "ZgotmplZ";

pub fn lookup(name: &str) -> Option<BuiltinFn> {
    let f: BuiltinFn = match name {
        HTML => |args| Ok(Value::String(html_escape(&plain(args)))),
        ATTR => |args| Ok(Value::String(html_escape(&plain(args)))),
        ATTR_UNQUOTED => |args| Ok(Value::String(attr_unquoted_escape(&plain(args)))),
        ATTR_NAME => |args| Ok(Value::String(attr_name_filter(&plain(args)))),
        URL_FILTER => |args| Ok(Value::String(url_filter(&plain(args)))),
        URL_NORMALIZE => |args| Ok(Value::String(url_normalize(&plain(args)))),
        URL_QUERY => |args| Ok(Value::String(query_escape(&plain(args)))),
        JS_VALUE => |args| Ok(Value::String(js_value(args))),
        CSS => |args| Ok(Value::String(css_filter(&plain(args)))),
        _ => return None,
    };
    Some(f)
}

pub fn is_filter(name: &str) -> bool {
    lookup(name).is_some()
}

/// Concatenate arguments as text, with null printing as nothing
fn plain(args: &[Value]) -> String {
    args.iter()
        .map(|v| match v {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect()
}

pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            '\0' => out.push('\u{FFFD}'),
            c => out.push(c),
        }
    }
    out
}

fn attr_unquoted_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' | '\t' | '\n' | '\r' | '\x0c' | '=' | '`' => {
                out.push_str(&format!("&#{};", c as u32))
            }
            c => out.push_str(&html_escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    out
}

fn attr_name_filter(s: &str) -> String {
    let valid = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'));
    if valid && attr_kind(s) == AttrKind::Normal {
        s.to_string()
    } else {
        FILTERED.to_string()
    }
}

/// Reject URLs whose scheme could run code
fn url_filter(s: &str) -> String {
    let scheme = s
        .find([':', '/', '?', '#'])
        .filter(|&i| s.as_bytes()[i] == b':')
        .map(|i| s[..i].to_ascii_lowercase());
    match scheme.as_deref() {
        None | Some("http") | Some("https") | Some("mailto") => s.to_string(),
        Some(_) => format!("#{}", FILTERED),
    }
}

/// Percent-encode bytes that may not appear in a URL, leaving existing
/// escapes and reserved characters alone
fn url_normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        let keep = b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'-' | b'.'
                    | b'_'
                    | b'~'
                    | b':'
                    | b'/'
                    | b'?'
                    | b'#'
                    | b'['
                    | b']'
                    | b'@'
                    | b'!'
                    | b'$'
                    | b'&'
                    | b'\''
                    | b'('
                    | b')'
                    | b'*'
                    | b'+'
                    | b','
                    | b';'
                    | b'='
                    | b'%'
            );
        if keep {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

pub fn query_escape(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// Render a value as a JavaScript expression safe to embed in HTML
fn js_value(args: &[Value]) -> String {
    let json = match args {
        [single] => single.to_string(),
        _ => Value::String(plain(args)).to_string(),
    };
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        match c {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

fn css_filter(s: &str) -> String {
    let safe = s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '#' | '%' | '.' | ',' | '_' | '-'));
    if safe {
        s.to_string()
    } else {
        FILTERED.to_string()
    }
}

/// Escape text for a JavaScript string literal
pub fn js_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '<' => out.push_str("\\u003C"),
            '>' => out.push_str("\\u003E"),
            '&' => out.push_str("\\u0026"),
            '=' => out.push_str("\\u003D"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04X}", c as u32)),
            c => out.push(c),
        }
    }
    out
}
