//! Builtin template functions and the custom function map

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::value::{compare, equal, is_true, kind};
use crate::escape::filters;

/// A function callable from a pipeline
pub type Func = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// Custom functions by name
pub type FuncMap = HashMap<String, Func>;

/// Plain builtin function
pub type BuiltinFn = fn(&[Value]) -> Result<Value, String>;

/// Wrap a closure as a [`Func`]
pub fn func<F>(f: F) -> Func
where
    F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub const BUILTINS: &[&str] = &[
    "and", "or", "not", "len", "index", "eq", "ne", "lt", "le", "gt", "ge", "print", "println",
    "printf", "html", "js", "urlquery",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

/// Look up a builtin by name
///
/// `and` and `or` returned here evaluate every argument; the executor
/// short-circuits them before reaching this table.
pub fn builtin(name: &str) -> Option<BuiltinFn> {
    let f: BuiltinFn = match name {
        "and" => |args| {
            at_least("and", args, 1)?;
            Ok(args
                .iter()
                .find(|v| !is_true(v))
                .unwrap_or(&args[args.len() - 1])
                .clone())
        },
        "or" => |args| {
            at_least("or", args, 1)?;
            Ok(args
                .iter()
                .find(|v| is_true(v))
                .unwrap_or(&args[args.len() - 1])
                .clone())
        },
        "not" => |args| {
            exactly("not", args, 1)?;
            Ok(Value::Bool(!is_true(&args[0])))
        },
        "len" => len,
        "index" => index,
        "eq" => |args| {
            at_least("eq", args, 2)?;
            Ok(Value::Bool(args[1..].iter().any(|b| equal(&args[0], b))))
        },
        "ne" => |args| {
            exactly("ne", args, 2)?;
            Ok(Value::Bool(!equal(&args[0], &args[1])))
        },
        "lt" => |args| ordered("lt", args, |o| o == Ordering::Less),
        "le" => |args| ordered("le", args, |o| o != Ordering::Greater),
        "gt" => |args| ordered("gt", args, |o| o == Ordering::Greater),
        "ge" => |args| ordered("ge", args, |o| o != Ordering::Less),
        "print" => |args| Ok(Value::String(sprint(args))),
        "println" => |args| Ok(Value::String(sprintln(args))),
        "printf" => printf,
        "html" => |args| Ok(Value::String(filters::html_escape(&sprint(args)))),
        "js" => |args| Ok(Value::String(filters::js_escape(&sprint(args)))),
        "urlquery" => |args| Ok(Value::String(filters::query_escape(&sprint(args)))),
        _ => return None,
    };
    Some(f)
}

fn exactly(name: &str, args: &[Value], want: usize) -> Result<(), String> {
    if args.len() == want {
        Ok(())
    } else {
        Err(format!(
            "wrong number of args for {}: want {} got {}",
            name,
            want,
            args.len()
        ))
    }
}

fn at_least(name: &str, args: &[Value], want: usize) -> Result<(), String> {
    if args.len() >= want {
        Ok(())
    } else {
        Err(format!(
            "wrong number of args for {}: want at least {} got {}",
            name,
            want,
            args.len()
        ))
    }
}

fn ordered(name: &str, args: &[Value], test: fn(Ordering) -> bool) -> Result<Value, String> {
    exactly(name, args, 2)?;
    Ok(Value::Bool(test(compare(&args[0], &args[1])?)))
}

fn len(args: &[Value]) -> Result<Value, String> {
    exactly("len", args, 1)?;
    let n = match &args[0] {
        Value::String(s) => s.len(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        other => return Err(format!("len of type {}", kind(other))),
    };
    Ok(Value::from(n))
}

fn index(args: &[Value]) -> Result<Value, String> {
    at_least("index", args, 1)?;
    let mut current = args[0].clone();
    for key in &args[1..] {
        current = match (&current, key) {
            (Value::Array(items), Value::Number(n)) => {
                let i = n
                    .as_i64()
                    .ok_or_else(|| format!("cannot index array with {}", n))?;
                usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .ok_or_else(|| format!("index out of range: {}", i))?
            }
            (Value::String(s), Value::Number(n)) => {
                let i = n
                    .as_i64()
                    .ok_or_else(|| format!("cannot index string with {}", n))?;
                usize::try_from(i)
                    .ok()
                    .and_then(|i| s.as_bytes().get(i))
                    .map(|b| Value::from(*b))
                    .ok_or_else(|| format!("index out of range: {}", i))?
            }
            (Value::Object(map), Value::String(k)) => map.get(k).cloned().unwrap_or(Value::Null),
            (Value::Null, _) => return Err("index of untyped nil".to_string()),
            (c, k) => {
                return Err(format!(
                    "can't index item of type {} with {}",
                    kind(c),
                    kind(k)
                ))
            }
        };
    }
    Ok(current)
}

/// Operand text for the print family
fn display(value: &Value) -> String {
    match value {
        Value::Null => "<nil>".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Operands joined with a space between any two non-strings
fn sprint(args: &[Value]) -> String {
    let mut out = String::new();
    for (i, v) in args.iter().enumerate() {
        if i > 0 && !args[i - 1].is_string() && !v.is_string() {
            out.push(' ');
        }
        out.push_str(&display(v));
    }
    out
}

fn sprintln(args: &[Value]) -> String {
    let mut out = args.iter().map(display).collect::<Vec<_>>().join(" ");
    out.push('\n');
    out
}

fn printf(args: &[Value]) -> Result<Value, String> {
    at_least("printf", args, 1)?;
    let format = match &args[0] {
        Value::String(s) => s,
        other => return Err(format!("printf format must be a string, got {}", kind(other))),
    };
    let mut operands = args[1..].iter();
    let mut out = String::new();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let Some(verb) = chars.next() else {
            out.push_str("%!(NOVERB)");
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        let Some(arg) = operands.next() else {
            out.push_str(&format!("%!{}(MISSING)", verb));
            continue;
        };
        match verb {
            'v' | 's' => out.push_str(&display(arg)),
            'd' => match arg.as_i64() {
                Some(n) => out.push_str(&n.to_string()),
                None => out.push_str(&format!("%!d({})", display(arg))),
            },
            'q' => out.push_str(&Value::String(display(arg)).to_string()),
            other => out.push_str(&format!("%!{}({})", other, display(arg))),
        }
    }
    Ok(Value::String(out))
}
