//! Syntax tree types for template text

/// Byte range in source text
pub type Span = std::ops::Range<usize>;

/// A parsed template body, addressable by name
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    pub name: String,
    pub root: Vec<Node>,
}

impl Tree {
    pub fn new(name: impl Into<String>, root: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            root,
        }
    }

    /// True when the body holds nothing but whitespace text
    pub fn is_empty(&self) -> bool {
        is_empty_list(&self.root)
    }

    /// Names of every template this tree calls, in source order
    pub fn calls(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_calls(&self.root, &mut out);
        out
    }
}

fn is_empty_list(nodes: &[Node]) -> bool {
    nodes.iter().all(|n| match n {
        Node::Text(s) => s.trim().is_empty(),
        _ => false,
    })
}

fn collect_calls<'a>(nodes: &'a [Node], out: &mut Vec<&'a str>) {
    for node in nodes {
        match node {
            Node::Template { name, .. } => out.push(name.as_str()),
            Node::If(b) | Node::Range(b) | Node::With(b) => {
                collect_calls(&b.list, out);
                if let Some(else_list) = &b.else_list {
                    collect_calls(else_list, out);
                }
            }
            Node::Block { name, list, .. } => {
                out.push(name.as_str());
                collect_calls(list, out);
            }
            Node::Text(_) | Node::Action(_) => {}
        }
    }
}

/// A single element of a template body
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Literal text, emitted as-is
    Text(String),
    /// `{{pipeline}}`
    Action(Pipeline),
    /// `{{if p}} ... {{else}} ... {{end}}`
    If(Branch),
    /// `{{range p}} ... {{else}} ... {{end}}`
    Range(Branch),
    /// `{{with p}} ... {{else}} ... {{end}}`
    With(Branch),
    /// `{{template "name" p}}`
    Template {
        name: String,
        pipeline: Option<Pipeline>,
        span: Span,
    },
    /// `{{block "name" p}} ... {{end}}`, only present until the parser hoists
    /// the body into its own tree
    Block {
        name: String,
        pipeline: Option<Pipeline>,
        list: Vec<Node>,
        span: Span,
    },
}

/// Shared shape of `if`, `range` and `with`
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub pipeline: Pipeline,
    pub list: Vec<Node>,
    pub else_list: Option<Vec<Node>>,
}

/// Commands chained with `|`
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub commands: Vec<Command>,
    pub span: Span,
}

impl Pipeline {
    /// Append a single-function command, feeding it the previous result
    pub fn push_func(&mut self, name: impl Into<String>) {
        self.commands.push(Command {
            args: vec![Arg::Func(name.into())],
        });
    }

    /// Names of every function invoked, nested pipelines included
    pub fn functions(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for cmd in &self.commands {
            for arg in &cmd.args {
                match arg {
                    Arg::Func(name) => out.push(name.as_str()),
                    Arg::Pipeline(inner) => out.extend(inner.functions()),
                    _ => {}
                }
            }
        }
        out
    }
}

/// An operand followed by its arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub args: Vec<Arg>,
}

/// A single operand in a command
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// `.`
    Dot,
    /// `.a.b`
    Field(Vec<String>),
    /// `$` or `$.a.b`
    Root(Vec<String>),
    /// Function name
    Func(String),
    Str(String),
    Number(f64),
    Bool(bool),
    Nil,
    /// `( pipeline )`
    Pipeline(Box<Pipeline>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Node {
        Node::Text(s.to_string())
    }

    #[test]
    fn test_whitespace_tree_is_empty() {
        let tree = Tree::new("t", vec![text("  \n\t"), text(" ")]);
        assert!(tree.is_empty());
        assert!(Tree::new("t", vec![]).is_empty());
    }

    #[test]
    fn test_action_tree_not_empty() {
        let tree = Tree::new(
            "t",
            vec![Node::Action(Pipeline {
                commands: vec![Command { args: vec![Arg::Dot] }],
                span: 0..1,
            })],
        );
        assert!(!tree.is_empty());
    }

    #[test]
    fn test_calls_walks_branches() {
        let call = |n: &str| Node::Template {
            name: n.to_string(),
            pipeline: None,
            span: 0..1,
        };
        let tree = Tree::new(
            "t",
            vec![
                call("a"),
                Node::If(Branch {
                    pipeline: Pipeline {
                        commands: vec![Command { args: vec![Arg::Dot] }],
                        span: 0..1,
                    },
                    list: vec![call("b")],
                    else_list: Some(vec![call("c")]),
                }),
            ],
        );
        assert_eq!(tree.calls(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_push_func_appends_command() {
        let mut p = Pipeline {
            commands: vec![Command {
                args: vec![Arg::Field(vec!["name".to_string()])],
            }],
            span: 0..5,
        };
        p.push_func("html");
        assert_eq!(p.commands.len(), 2);
        assert_eq!(p.functions(), vec!["html"]);
    }
}
