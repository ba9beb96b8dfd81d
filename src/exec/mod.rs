//! Tree execution against JSON data
//!
//! [`execute`] walks a parsed [`Tree`], evaluating pipelines against a
//! `serde_json::Value` and writing text to any `io::Write`. It knows nothing
//! about escaping: by the time a tree reaches it, the escaper has already
//! appended whatever sanitising functions the output needs.

mod error;
mod funcs;
mod value;

use std::collections::HashMap;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::escape::filters;
use crate::parser::ast::{Arg, Branch, Command, Node, Pipeline, Tree};

pub use error::ExecError;
pub use funcs::{builtin, func, is_builtin, BuiltinFn, Func, FuncMap, BUILTINS};
pub use value::{is_true, kind, to_text};

/// Nesting limit for `{{template}}` calls and block bodies together
pub const MAX_EXEC_DEPTH: usize = 256;

/// Behaviour when a field is missing from the data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingKey {
    /// Yield null
    #[default]
    #[serde(alias = "invalid")]
    Default,
    /// Yield null; kept distinct so configuration round-trips
    Zero,
    /// Fail execution
    Error,
}

impl FromStr for MissingKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" | "invalid" => Ok(Self::Default),
            "zero" => Ok(Self::Zero),
            "error" => Ok(Self::Error),
            other => Err(format!("unrecognized missingkey value {:?}", other)),
        }
    }
}

/// Everything a tree needs at run time besides its data
pub struct Env<'a> {
    /// Trees reachable through `{{template}}`
    pub templates: &'a HashMap<String, Arc<Tree>>,
    pub funcs: &'a FuncMap,
    pub missing_key: MissingKey,
}

/// Run `tree` against `data`, writing output to `out`
pub fn execute<W: Write + ?Sized>(
    tree: &Tree,
    env: &Env<'_>,
    data: &Value,
    out: &mut W,
) -> Result<(), ExecError> {
    let mut state = State {
        env,
        out,
        root: data,
        template: &tree.name,
        depth: 0,
    };
    state.walk(data, &tree.root)
}

struct State<'a, W: ?Sized> {
    env: &'a Env<'a>,
    out: &'a mut W,
    root: &'a Value,
    template: &'a str,
    depth: usize,
}

impl<'a, W: Write + ?Sized> State<'a, W> {
    fn walk(&mut self, dot: &Value, nodes: &'a [Node]) -> Result<(), ExecError> {
        for node in nodes {
            match node {
                Node::Text(text) => self.out.write_all(text.as_bytes())?,
                Node::Action(pipeline) => {
                    let value = self.pipeline(dot, pipeline)?;
                    self.out.write_all(to_text(&value).as_bytes())?;
                }
                Node::If(branch) => {
                    let value = self.pipeline(dot, &branch.pipeline)?;
                    if is_true(&value) {
                        self.nested(dot, &branch.list)?;
                    } else if let Some(else_list) = &branch.else_list {
                        self.nested(dot, else_list)?;
                    }
                }
                Node::With(branch) => {
                    let value = self.pipeline(dot, &branch.pipeline)?;
                    if is_true(&value) {
                        self.nested(&value, &branch.list)?;
                    } else if let Some(else_list) = &branch.else_list {
                        self.nested(dot, else_list)?;
                    }
                }
                Node::Range(branch) => self.range(dot, branch)?,
                Node::Template { name, pipeline, .. } | Node::Block { name, pipeline, .. } => {
                    let next = match pipeline {
                        Some(p) => self.pipeline(dot, p)?,
                        None => Value::Null,
                    };
                    self.call_template(name, &next)?;
                }
            }
        }
        Ok(())
    }

    fn range(&mut self, dot: &Value, branch: &'a Branch) -> Result<(), ExecError> {
        let value = self.pipeline(dot, &branch.pipeline)?;
        let items: Vec<&Value> = match &value {
            Value::Array(items) => items.iter().collect(),
            Value::Object(map) => map.values().collect(),
            Value::Null => Vec::new(),
            other => {
                return Err(ExecError::Range {
                    template: self.template.to_string(),
                    kind: kind(other),
                })
            }
        };
        if items.is_empty() {
            if let Some(else_list) = &branch.else_list {
                self.nested(dot, else_list)?;
            }
            return Ok(());
        }
        for item in items {
            self.nested(item, &branch.list)?;
        }
        Ok(())
    }

    /// Walk a block body one level deeper
    fn nested(&mut self, dot: &Value, nodes: &'a [Node]) -> Result<(), ExecError> {
        self.enter()?;
        let result = self.walk(dot, nodes);
        self.depth -= 1;
        result
    }

    fn enter(&mut self) -> Result<(), ExecError> {
        if self.depth >= MAX_EXEC_DEPTH {
            return Err(ExecError::Depth {
                template: self.template.to_string(),
                depth: MAX_EXEC_DEPTH,
            });
        }
        self.depth += 1;
        Ok(())
    }

    fn call_template(&mut self, name: &str, dot: &Value) -> Result<(), ExecError> {
        let templates = self.env.templates;
        let Some(tree) = templates.get(name) else {
            return Err(ExecError::UndefinedTemplate {
                template: self.template.to_string(),
                name: name.to_string(),
            });
        };
        self.enter()?;
        let caller = self.template;
        self.template = &tree.name;
        let result = self.walk(dot, &tree.root);
        self.depth -= 1;
        self.template = caller;
        result
    }

    fn pipeline(&mut self, dot: &Value, pipeline: &Pipeline) -> Result<Value, ExecError> {
        let mut last = None;
        for cmd in &pipeline.commands {
            last = Some(self.command(dot, cmd, last.take())?);
        }
        Ok(last.unwrap_or(Value::Null))
    }

    fn command(
        &mut self,
        dot: &Value,
        cmd: &Command,
        piped: Option<Value>,
    ) -> Result<Value, ExecError> {
        let Some((first, rest)) = cmd.args.split_first() else {
            return Ok(piped.unwrap_or(Value::Null));
        };
        match first {
            Arg::Func(name) => self.call(dot, name, rest, piped),
            operand if rest.is_empty() && piped.is_none() => self.arg(dot, operand),
            operand => Err(ExecError::NotAFunction {
                template: self.template.to_string(),
                operand: describe(operand),
            }),
        }
    }

    fn call(
        &mut self,
        dot: &Value,
        name: &str,
        args: &[Arg],
        piped: Option<Value>,
    ) -> Result<Value, ExecError> {
        let funcs = self.env.funcs;
        let custom = funcs.get(name);
        if custom.is_none() && matches!(name, "and" | "or") {
            return self.short_circuit(dot, name, args, piped);
        }

        let mut values = Vec::with_capacity(args.len() + 1);
        for arg in args {
            values.push(self.arg(dot, arg)?);
        }
        values.extend(piped);

        let result = if let Some(f) = filters::lookup(name) {
            f(&values)
        } else if let Some(f) = custom {
            f(&values)
        } else if let Some(f) = builtin(name) {
            f(&values)
        } else {
            return Err(ExecError::UndefinedFunction {
                template: self.template.to_string(),
                name: name.to_string(),
            });
        };
        result.map_err(|message| ExecError::Func {
            template: self.template.to_string(),
            name: name.to_string(),
            message,
        })
    }

    /// `and` stops at the first false operand, `or` at the first true one
    fn short_circuit(
        &mut self,
        dot: &Value,
        name: &str,
        args: &[Arg],
        piped: Option<Value>,
    ) -> Result<Value, ExecError> {
        if args.is_empty() && piped.is_none() {
            return Err(ExecError::Func {
                template: self.template.to_string(),
                name: name.to_string(),
                message: format!("wrong number of args for {}: want at least 1 got 0", name),
            });
        }
        let stop_on = name == "or";
        let mut last = Value::Null;
        for arg in args {
            last = self.arg(dot, arg)?;
            if is_true(&last) == stop_on {
                return Ok(last);
            }
        }
        Ok(piped.unwrap_or(last))
    }

    fn arg(&mut self, dot: &Value, arg: &Arg) -> Result<Value, ExecError> {
        match arg {
            Arg::Dot => Ok(dot.clone()),
            Arg::Field(path) => self.field(dot, path),
            Arg::Root(path) => self.field(self.root, path),
            Arg::Func(name) => self.call(dot, name, &[], None),
            Arg::Str(s) => Ok(Value::String(s.clone())),
            Arg::Number(n) => Ok(value::number(*n)),
            Arg::Bool(b) => Ok(Value::Bool(*b)),
            Arg::Nil => Ok(Value::Null),
            Arg::Pipeline(p) => self.pipeline(dot, p),
        }
    }

    fn field(&self, base: &Value, path: &[String]) -> Result<Value, ExecError> {
        let mut current = base;
        for key in path {
            current = match current {
                Value::Object(map) => match map.get(key) {
                    Some(v) => v,
                    None => return self.missing(key),
                },
                Value::Null => return self.missing(key),
                other => {
                    return Err(ExecError::NotAnObject {
                        template: self.template.to_string(),
                        field: key.clone(),
                        kind: kind(other),
                    })
                }
            };
        }
        Ok(current.clone())
    }

    fn missing(&self, key: &str) -> Result<Value, ExecError> {
        match self.env.missing_key {
            MissingKey::Default | MissingKey::Zero => Ok(Value::Null),
            MissingKey::Error => Err(ExecError::MissingKey {
                template: self.template.to_string(),
                key: key.to_string(),
            }),
        }
    }
}

/// Operand as written, for error messages
fn describe(arg: &Arg) -> String {
    match arg {
        Arg::Dot => ".".to_string(),
        Arg::Field(path) => format!(".{}", path.join(".")),
        Arg::Root(path) if path.is_empty() => "$".to_string(),
        Arg::Root(path) => format!("$.{}", path.join(".")),
        Arg::Func(name) => name.clone(),
        Arg::Str(s) => format!("{:?}", s),
        Arg::Number(n) => n.to_string(),
        Arg::Bool(b) => b.to_string(),
        Arg::Nil => "nil".to_string(),
        Arg::Pipeline(_) => "(pipeline)".to_string(),
    }
}
