//! Parser implementation using chumsky

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;

use crate::error::ParseError;
use crate::parser::ast::*;
use crate::parser::lexer::{self, Delims, Item, Token};

/// Deepest nesting of control actions and parentheses accepted
pub const MAX_PARSE_DEPTH: usize = 100;

/// Top-level element of one parsed text
#[derive(Debug, Clone)]
enum TopLevel {
    Define {
        name: String,
        list: Vec<Node>,
        span: Span,
    },
    Node(Node),
}

/// Parse template text with the default delimiters
///
/// Function names are not checked; use [`parse_with`] for that.
pub fn parse(name: &str, text: &str) -> Result<Vec<Tree>, Vec<ParseError>> {
    parse_with(name, text, &Delims::default(), |_| true)
}

/// Parse template text into the main tree plus one tree per `define`/`block`
///
/// The main tree, named `name`, is always first. `is_function` decides which
/// identifiers are callable.
pub fn parse_with(
    name: &str,
    text: &str,
    delims: &Delims,
    is_function: impl Fn(&str) -> bool,
) -> Result<Vec<Tree>, Vec<ParseError>> {
    let len = text.len();
    let items = lexer::lex(text, delims).map_err(|e| vec![e])?;
    check_depth(&items).map_err(|e| vec![e])?;

    let token_iter = items.into_iter().map(|(item, span)| (item, span.into()));

    // Turn the item iterator into a stream that chumsky can use
    let token_stream = Stream::from_iter(token_iter)
        .map((len..len).into(), |(t, s): (_, _)| (t, s));

    let top = template_parser()
        .parse(token_stream)
        .into_result()
        .map_err(|errs| errs.into_iter().map(ParseError::from).collect::<Vec<_>>())?;

    let trees = assemble(name, len, top).map_err(|e| vec![e])?;

    let errors = undefined_functions(&trees, &is_function);
    if errors.is_empty() {
        Ok(trees)
    } else {
        Err(errors)
    }
}

/// Reject nesting the recursive parser could not descend safely
fn check_depth(items: &[(Item, Span)]) -> Result<(), ParseError> {
    let mut depth = 0usize;
    let mut after_open = false;
    for (item, span) in items {
        let (opens, closes) = match item {
            Item::Tok(Token::If | Token::Range | Token::With | Token::Block | Token::Define) => {
                (after_open, false)
            }
            Item::Tok(Token::End) => (false, after_open),
            Item::Tok(Token::ParenOpen) => (true, false),
            Item::Tok(Token::ParenClose) => (false, true),
            _ => (false, false),
        };
        if opens {
            depth += 1;
            if depth > MAX_PARSE_DEPTH {
                return Err(ParseError::Syntax {
                    span: span.clone(),
                    message: format!("nesting deeper than {} levels", MAX_PARSE_DEPTH),
                    expected: vec![],
                });
            }
        }
        if closes {
            depth = depth.saturating_sub(1);
        }
        after_open = matches!(item, Item::Open);
    }
    Ok(())
}

/// Helper to extract span range from chumsky's MapExtra
fn span_range(e: &impl chumsky::span::Span<Offset = usize>) -> std::ops::Range<usize> {
    e.start()..e.end()
}

fn template_parser<'a, I>() -> impl Parser<'a, I, Vec<TopLevel>, extra::Err<Rich<'a, Item>>> + Clone
where
    I: ValueInput<'a, Token = Item, Span = SimpleSpan>,
{
    let open = just(Item::Open);
    let close = just(Item::Close);

    let string_literal = select! {
        Item::Tok(Token::String(s)) => s,
    };

    let pipeline = recursive(|pipeline| {
        let operand = choice((
            select! {
                Item::Tok(Token::Dot) => Arg::Dot,
                Item::Tok(Token::Field(path)) => Arg::Field(path),
                Item::Tok(Token::Root(path)) => Arg::Root(path),
                Item::Tok(Token::Ident(name)) => Arg::Func(name),
                Item::Tok(Token::String(s)) => Arg::Str(s),
                Item::Tok(Token::Number(n)) => Arg::Number(n),
                Item::Tok(Token::True) => Arg::Bool(true),
                Item::Tok(Token::False) => Arg::Bool(false),
                Item::Tok(Token::Nil) => Arg::Nil,
            },
            // Parenthesised sub-pipeline
            pipeline
                .delimited_by(
                    just(Item::Tok(Token::ParenOpen)),
                    just(Item::Tok(Token::ParenClose)),
                )
                .map(|p: Pipeline| Arg::Pipeline(Box::new(p))),
        ));

        let command = operand
            .repeated()
            .at_least(1)
            .collect::<Vec<_>>()
            .map(|args| Command { args });

        command
            .separated_by(just(Item::Tok(Token::Pipe)))
            .at_least(1)
            .collect::<Vec<_>>()
            .map_with(|commands, e| Pipeline {
                commands,
                span: span_range(&e.span()),
            })
    });

    let end_action = open
        .clone()
        .then(just(Item::Tok(Token::End)))
        .then(close.clone())
        .ignored();

    let node = recursive(|node| {
        let list = node.clone().repeated().collect::<Vec<Node>>();

        let text = select! {
            Item::Text(s) => Node::Text(s),
        };

        let action = open
            .clone()
            .ignore_then(pipeline.clone())
            .then_ignore(close.clone())
            .map(Node::Action);

        // {{else}} followed by its body
        let else_list = open
            .clone()
            .then(just(Item::Tok(Token::Else)))
            .then(close.clone())
            .ignore_then(list.clone());

        // {{else if p}} followed by its body
        let else_if = open
            .clone()
            .ignore_then(just(Item::Tok(Token::Else)))
            .ignore_then(just(Item::Tok(Token::If)))
            .ignore_then(pipeline.clone())
            .then_ignore(close.clone())
            .then(list.clone());

        let if_node = open
            .clone()
            .ignore_then(just(Item::Tok(Token::If)))
            .ignore_then(pipeline.clone())
            .then_ignore(close.clone())
            .then(list.clone())
            .then(else_if.repeated().collect::<Vec<_>>())
            .then(else_list.clone().or_not())
            .then_ignore(end_action.clone())
            .map(|(((pipeline, list), else_ifs), else_list)| {
                build_if(pipeline, list, else_ifs, else_list)
            });

        let range_node = open
            .clone()
            .ignore_then(just(Item::Tok(Token::Range)))
            .ignore_then(pipeline.clone())
            .then_ignore(close.clone())
            .then(list.clone())
            .then(else_list.clone().or_not())
            .then_ignore(end_action.clone())
            .map(|((pipeline, list), else_list)| {
                Node::Range(Branch {
                    pipeline,
                    list,
                    else_list,
                })
            });

        let with_node = open
            .clone()
            .ignore_then(just(Item::Tok(Token::With)))
            .ignore_then(pipeline.clone())
            .then_ignore(close.clone())
            .then(list.clone())
            .then(else_list.or_not())
            .then_ignore(end_action.clone())
            .map(|((pipeline, list), else_list)| {
                Node::With(Branch {
                    pipeline,
                    list,
                    else_list,
                })
            });

        let template_node = open
            .clone()
            .ignore_then(just(Item::Tok(Token::Template)))
            .ignore_then(string_literal.clone())
            .then(pipeline.clone().or_not())
            .then_ignore(close.clone())
            .map_with(|(name, pipeline), e| Node::Template {
                name,
                pipeline,
                span: span_range(&e.span()),
            });

        let block_node = open
            .clone()
            .ignore_then(just(Item::Tok(Token::Block)))
            .ignore_then(string_literal.clone())
            .then(pipeline.clone().or_not())
            .then_ignore(close.clone())
            .then(list)
            .then_ignore(end_action.clone())
            .map_with(|((name, pipeline), list), e| Node::Block {
                name,
                pipeline,
                list,
                span: span_range(&e.span()),
            });

        // Control actions before plain actions: they share the left delimiter
        choice((
            text,
            if_node,
            range_node,
            with_node,
            template_node,
            block_node,
            action,
        ))
        .boxed()
    });

    let define = open
        .ignore_then(just(Item::Tok(Token::Define)))
        .ignore_then(string_literal)
        .then_ignore(close)
        .then(node.clone().repeated().collect::<Vec<_>>())
        .then_ignore(end_action)
        .map_with(|(name, list), e| TopLevel::Define {
            name,
            list,
            span: span_range(&e.span()),
        });

    choice((define, node.map(TopLevel::Node)))
        .repeated()
        .collect()
        .then_ignore(end())
}

/// Fold `else if` chains into nested `if` nodes
fn build_if(
    pipeline: Pipeline,
    list: Vec<Node>,
    else_ifs: Vec<(Pipeline, Vec<Node>)>,
    else_list: Option<Vec<Node>>,
) -> Node {
    let mut tail = else_list;
    for (p, l) in else_ifs.into_iter().rev() {
        tail = Some(vec![Node::If(Branch {
            pipeline: p,
            list: l,
            else_list: tail,
        })]);
    }
    Node::If(Branch {
        pipeline,
        list,
        else_list: tail,
    })
}

/// Build the tree set: main tree first, then each definition
fn assemble(name: &str, len: usize, top: Vec<TopLevel>) -> Result<Vec<Tree>, ParseError> {
    let mut main = Vec::new();
    let mut defined: Vec<(Tree, Span)> = Vec::new();

    for item in top {
        match item {
            TopLevel::Define { name, list, span } => {
                let list = hoist_blocks(list, &mut defined)?;
                add_tree(&mut defined, Tree::new(name, list), span)?;
            }
            TopLevel::Node(node) => {
                main.extend(hoist_blocks(vec![node], &mut defined)?);
            }
        }
    }

    let mut trees = vec![(Tree::new(name, main), 0..len)];
    for (tree, span) in defined {
        add_tree(&mut trees, tree, span)?;
    }
    Ok(trees.into_iter().map(|(t, _)| t).collect())
}

/// Within one text, an empty definition never replaces a non-empty one and
/// two non-empty definitions of one name conflict
fn add_tree(trees: &mut Vec<(Tree, Span)>, tree: Tree, span: Span) -> Result<(), ParseError> {
    match trees.iter_mut().find(|(t, _)| t.name == tree.name) {
        None => trees.push((tree, span)),
        Some((existing, _)) if existing.is_empty() => *existing = tree,
        Some(_) if tree.is_empty() => {}
        Some(_) => {
            return Err(ParseError::Syntax {
                message: format!("multiple definition of template {:?}", tree.name),
                span,
                expected: vec![],
            })
        }
    }
    Ok(())
}

/// Replace `block` nodes with calls, moving their bodies into definitions
fn hoist_blocks(nodes: Vec<Node>, defined: &mut Vec<(Tree, Span)>) -> Result<Vec<Node>, ParseError> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        let node = match node {
            Node::Block {
                name,
                pipeline,
                list,
                span,
            } => {
                let list = hoist_blocks(list, defined)?;
                add_tree(defined, Tree::new(name.clone(), list), span.clone())?;
                Node::Template {
                    name,
                    pipeline,
                    span,
                }
            }
            Node::If(b) => Node::If(hoist_branch(b, defined)?),
            Node::Range(b) => Node::Range(hoist_branch(b, defined)?),
            Node::With(b) => Node::With(hoist_branch(b, defined)?),
            other => other,
        };
        out.push(node);
    }
    Ok(out)
}

fn hoist_branch(branch: Branch, defined: &mut Vec<(Tree, Span)>) -> Result<Branch, ParseError> {
    Ok(Branch {
        pipeline: branch.pipeline,
        list: hoist_blocks(branch.list, defined)?,
        else_list: match branch.else_list {
            Some(l) => Some(hoist_blocks(l, defined)?),
            None => None,
        },
    })
}

fn undefined_functions(trees: &[Tree], is_function: &impl Fn(&str) -> bool) -> Vec<ParseError> {
    let mut errors = Vec::new();
    for tree in trees {
        check_list(&tree.root, is_function, &mut errors);
    }
    errors
}

fn check_list(nodes: &[Node], is_function: &impl Fn(&str) -> bool, errors: &mut Vec<ParseError>) {
    for node in nodes {
        match node {
            Node::Action(p) => check_pipeline(p, is_function, errors),
            Node::If(b) | Node::Range(b) | Node::With(b) => {
                check_pipeline(&b.pipeline, is_function, errors);
                check_list(&b.list, is_function, errors);
                if let Some(else_list) = &b.else_list {
                    check_list(else_list, is_function, errors);
                }
            }
            Node::Template {
                pipeline: Some(p), ..
            } => check_pipeline(p, is_function, errors),
            Node::Block { pipeline, list, .. } => {
                if let Some(p) = pipeline {
                    check_pipeline(p, is_function, errors);
                }
                check_list(list, is_function, errors);
            }
            Node::Template { pipeline: None, .. } | Node::Text(_) => {}
        }
    }
}

fn check_pipeline(p: &Pipeline, is_function: &impl Fn(&str) -> bool, errors: &mut Vec<ParseError>) {
    for name in p.functions() {
        if !is_function(name) {
            errors.push(ParseError::UndefinedFunction {
                span: p.span.clone(),
                name: name.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(text: &str) -> Vec<Node> {
        let trees = parse("main", text).expect("Should parse");
        assert_eq!(trees.len(), 1);
        trees.into_iter().next().map(|t| t.root).unwrap_or_default()
    }

    #[test]
    fn test_parse_nesting_at_limit() {
        let text = format!(
            "{}x{}",
            "{{if .}}".repeat(MAX_PARSE_DEPTH),
            "{{end}}".repeat(MAX_PARSE_DEPTH)
        );
        assert!(parse("main", &text).is_ok());
    }

    #[test]
    fn test_parse_nesting_too_deep() {
        let n = 500;
        let text = format!("{}x{}", "{{if .}}".repeat(n), "{{end}}".repeat(n));
        let errors = parse("main", &text).expect_err("too deep");
        assert!(matches!(
            &errors[..],
            [ParseError::Syntax { message, .. }] if message.contains("nesting")
        ));
    }

    #[test]
    fn test_parse_paren_nesting_too_deep() {
        let n = MAX_PARSE_DEPTH + 1;
        let text = format!("{{{{{}.{}}}}}", "(".repeat(n), ")".repeat(n));
        assert!(parse("main", &text).is_err());
    }

    #[test]
    fn test_parse_plain_text() {
        let nodes = single("hello world");
        assert_eq!(nodes, vec![Node::Text("hello world".to_string())]);
    }

    #[test]
    fn test_parse_field_action() {
        let nodes = single("Hi {{.user.name}}");
        assert_eq!(nodes.len(), 2);
        match &nodes[1] {
            Node::Action(p) => {
                assert_eq!(p.commands.len(), 1);
                assert_eq!(
                    p.commands[0].args,
                    vec![Arg::Field(vec!["user".to_string(), "name".to_string()])]
                );
            }
            other => panic!("Expected action, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_pipeline_with_function() {
        let nodes = single(r#"{{.name | printf "%s!" | len}}"#);
        match &nodes[0] {
            Node::Action(p) => {
                assert_eq!(p.commands.len(), 3);
                assert_eq!(
                    p.commands[1].args,
                    vec![Arg::Func("printf".to_string()), Arg::Str("%s!".to_string())]
                );
            }
            other => panic!("Expected action, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_parenthesised_argument() {
        let nodes = single("{{eq (len .items) 0}}");
        match &nodes[0] {
            Node::Action(p) => match &p.commands[0].args[1] {
                Arg::Pipeline(inner) => {
                    assert_eq!(inner.commands[0].args[0], Arg::Func("len".to_string()));
                }
                other => panic!("Expected sub-pipeline, got {:?}", other),
            },
            other => panic!("Expected action, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_literals() {
        let nodes = single("{{print 1 true false nil $ $.x}}");
        match &nodes[0] {
            Node::Action(p) => assert_eq!(
                p.commands[0].args,
                vec![
                    Arg::Func("print".to_string()),
                    Arg::Number(1.0),
                    Arg::Bool(true),
                    Arg::Bool(false),
                    Arg::Nil,
                    Arg::Root(vec![]),
                    Arg::Root(vec!["x".to_string()]),
                ]
            ),
            other => panic!("Expected action, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_if_else() {
        let nodes = single("{{if .a}}A{{else}}B{{end}}");
        match &nodes[0] {
            Node::If(b) => {
                assert_eq!(b.list, vec![Node::Text("A".to_string())]);
                assert_eq!(b.else_list, Some(vec![Node::Text("B".to_string())]));
            }
            other => panic!("Expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_else_if_chain() {
        let nodes = single("{{if .a}}A{{else if .b}}B{{else}}C{{end}}");
        match &nodes[0] {
            Node::If(outer) => match outer.else_list.as_deref() {
                Some([Node::If(inner)]) => {
                    assert_eq!(inner.list, vec![Node::Text("B".to_string())]);
                    assert_eq!(inner.else_list, Some(vec![Node::Text("C".to_string())]));
                }
                other => panic!("Expected nested if, got {:?}", other),
            },
            other => panic!("Expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_range_with_else() {
        let nodes = single("{{range .items}}<li>{{.}}</li>{{else}}none{{end}}");
        match &nodes[0] {
            Node::Range(b) => {
                assert_eq!(b.list.len(), 3);
                assert!(b.else_list.is_some());
            }
            other => panic!("Expected range, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_with() {
        let nodes = single("{{with .user}}{{.name}}{{end}}");
        assert!(matches!(&nodes[0], Node::With(b) if b.else_list.is_none()));
    }

    #[test]
    fn test_parse_nested_control() {
        let nodes = single("{{range .}}{{if .ok}}y{{end}}{{end}}");
        match &nodes[0] {
            Node::Range(b) => assert!(matches!(b.list[0], Node::If(_))),
            other => panic!("Expected range, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_template_call() {
        let nodes = single(r#"{{template "row" .}}{{template "footer"}}"#);
        match (&nodes[0], &nodes[1]) {
            (
                Node::Template {
                    name: a,
                    pipeline: Some(_),
                    ..
                },
                Node::Template {
                    name: b,
                    pipeline: None,
                    ..
                },
            ) => {
                assert_eq!(a, "row");
                assert_eq!(b, "footer");
            }
            other => panic!("Expected two calls, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_define_creates_tree() {
        let trees = parse("main", r#"{{define "a"}}A{{end}}{{define "b"}}B{{end}}"#)
            .expect("Should parse");
        let names: Vec<&str> = trees.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["main", "a", "b"]);
        assert!(trees[0].is_empty());
    }

    #[test]
    fn test_parse_block_hoisted() {
        let trees = parse("main", r#"<h1>{{block "title" .}}Default{{end}}</h1>"#)
            .expect("Should parse");
        assert_eq!(trees.len(), 2);
        assert!(matches!(&trees[0].root[1], Node::Template { name, .. } if name == "title"));
        assert_eq!(trees[1].name, "title");
        assert_eq!(trees[1].root, vec![Node::Text("Default".to_string())]);
    }

    #[test]
    fn test_parse_empty_define_does_not_replace() {
        let trees = parse(
            "main",
            r#"{{define "a"}}full{{end}}{{define "a"}} {{end}}"#,
        )
        .expect("Should parse");
        assert_eq!(trees[1].root, vec![Node::Text("full".to_string())]);
    }

    #[test]
    fn test_parse_duplicate_define_error() {
        let result = parse("main", r#"{{define "a"}}1{{end}}{{define "a"}}2{{end}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_missing_end_error() {
        assert!(parse("main", "{{if .a}}open").is_err());
    }

    #[test]
    fn test_parse_stray_end_error() {
        assert!(parse("main", "text{{end}}").is_err());
    }

    #[test]
    fn test_parse_empty_action_error() {
        assert!(parse("main", "{{}}").is_err());
    }

    #[test]
    fn test_parse_define_inside_body_error() {
        assert!(parse("main", r#"{{if .}}{{define "x"}}x{{end}}{{end}}"#).is_err());
    }

    #[test]
    fn test_undefined_function_reported() {
        let result = parse_with("main", "{{shout .}}", &Delims::default(), |f| f == "print");
        match result {
            Err(errors) => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(
                    &errors[0],
                    ParseError::UndefinedFunction { name, .. } if name == "shout"
                ));
            }
            Ok(_) => panic!("Expected undefined function error"),
        }
    }

    #[test]
    fn test_custom_delimiters() {
        let trees = parse_with("main", "[[.x]]{{.y}}", &Delims::new("[[", "]]"), |_| true)
            .expect("Should parse");
        assert_eq!(trees[0].root.len(), 2);
        assert_eq!(trees[0].root[1], Node::Text("{{.y}}".to_string()));
    }
}
