//! Contextual HTML escaper

use std::collections::HashSet;

use super::context::{advance, AttrKind, Context, Delim, State, UrlPart};
use super::filters;
use super::{EscapeError, EscapeState, Escaper, TemplateSet};
use crate::parser::ast::{Node, Pipeline, Tree};

/// Escapes action output for the HTML context it appears in
///
/// Each action gets sanitising functions appended to its pipeline according
/// to the context the surrounding text leaves it in. A template and every
/// unescaped template it calls are analysed together; nothing is committed
/// unless all of them pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlEscaper;

/// Maximum nesting of template calls and block bodies during analysis
pub const MAX_ESCAPE_DEPTH: usize = 256;

impl Escaper for HtmlEscaper {
    fn escape(&self, name: &str, set: &mut TemplateSet<'_>) -> Result<(), EscapeError> {
        let rewritten = {
            let mut analysis = Analysis {
                set: &*set,
                in_progress: HashSet::new(),
                done: Vec::new(),
                depth: 0,
            };
            analysis.visit(name, name)?;
            analysis.done
        };
        for (name, tree) in rewritten {
            set.commit(&name, tree);
        }
        Ok(())
    }
}

struct Analysis<'s, 'a> {
    set: &'s TemplateSet<'a>,
    in_progress: HashSet<String>,
    /// Rewritten trees awaiting commit, callees first
    done: Vec<(String, Tree)>,
    depth: usize,
}

impl Analysis<'_, '_> {
    fn visit(&mut self, name: &str, caller: &str) -> Result<(), EscapeError> {
        if self.in_progress.contains(name) || self.done.iter().any(|(n, _)| n == name) {
            return Ok(());
        }
        let no_such = || EscapeError::NoSuchTemplate {
            template: caller.to_string(),
            callee: name.to_string(),
        };
        match self.set.state(name).ok_or_else(no_such)? {
            EscapeState::Escaped => return Ok(()),
            EscapeState::Failed(cause) => {
                return Err(EscapeError::Callee {
                    template: caller.to_string(),
                    callee: name.to_string(),
                    cause: Box::new(cause.clone()),
                })
            }
            EscapeState::Unresolved => {}
        }
        let mut tree = self.set.tree(name).ok_or_else(no_such)?.clone();

        self.in_progress.insert(name.to_string());
        let end = self.list(name, &mut tree.root, Context::default())?;
        self.in_progress.remove(name);

        if end.state != State::Text {
            return Err(EscapeError::EndContext {
                template: name.to_string(),
                context: end.to_string(),
            });
        }
        self.done.push((name.to_string(), tree));
        Ok(())
    }

    fn list(
        &mut self,
        template: &str,
        nodes: &mut [Node],
        ctx: Context,
    ) -> Result<Context, EscapeError> {
        if self.depth >= MAX_ESCAPE_DEPTH {
            return Err(EscapeError::Depth {
                template: template.to_string(),
                depth: MAX_ESCAPE_DEPTH,
            });
        }
        self.depth += 1;
        let end = self.nodes(template, nodes, ctx);
        self.depth -= 1;
        end
    }

    fn nodes(
        &mut self,
        template: &str,
        nodes: &mut [Node],
        mut ctx: Context,
    ) -> Result<Context, EscapeError> {
        for node in nodes.iter_mut() {
            if matches!(node, Node::Action(_)) && ctx.state == State::Comment {
                *node = Node::Text(String::new());
                continue;
            }
            ctx = match node {
                Node::Text(text) => advance(ctx, text),
                Node::Action(pipeline) => action(pipeline, ctx),
                Node::If(branch) | Node::With(branch) => {
                    let then = self.list(template, &mut branch.list, ctx)?;
                    let otherwise = match &mut branch.else_list {
                        Some(list) => self.list(template, list, ctx)?,
                        None => ctx,
                    };
                    join(template, then, otherwise)?
                }
                Node::Range(branch) => {
                    let body = self.list(template, &mut branch.list, ctx)?;
                    if body != ctx {
                        return Err(EscapeError::RangeLoop {
                            template: template.to_string(),
                            context: body.to_string(),
                            expected: ctx.to_string(),
                        });
                    }
                    let otherwise = match &mut branch.else_list {
                        Some(list) => self.list(template, list, ctx)?,
                        None => ctx,
                    };
                    join(template, body, otherwise)?
                }
                Node::Template { name, .. } | Node::Block { name, .. } => {
                    if ctx.state != State::Text {
                        return Err(EscapeError::CallContext {
                            template: template.to_string(),
                            callee: name.clone(),
                            context: ctx.to_string(),
                        });
                    }
                    self.visit(name, template)?;
                    ctx
                }
            };
        }
        Ok(ctx)
    }
}

/// Append the sanitisers for `ctx` and return the context after the output
fn action(pipeline: &mut Pipeline, ctx: Context) -> Context {
    let (names, next): (&[&str], Context) = match ctx.state {
        State::Text | State::Comment => (&[filters::HTML], ctx),
        State::Tag | State::AfterName => (
            &[filters::ATTR_NAME],
            Context {
                state: State::AfterName,
                attr: AttrKind::Normal,
                ..ctx
            },
        ),
        State::AttrName => (&[filters::ATTR_NAME], ctx),
        State::Script => (&[filters::JS_VALUE], ctx),
        State::Style => (&[filters::CSS], ctx),
        State::BeforeValue | State::AttrValue => {
            let value = if ctx.state == State::BeforeValue {
                Context {
                    state: State::AttrValue,
                    delim: Delim::Space,
                    ..ctx
                }
            } else {
                ctx
            };
            for name in value_filters(value) {
                pipeline.push_func(*name);
            }
            let quote = if value.delim == Delim::Space {
                filters::ATTR_UNQUOTED
            } else {
                filters::ATTR
            };
            pipeline.push_func(quote);
            let mut next = value;
            if next.attr == AttrKind::Url && next.url_part == UrlPart::None {
                next.url_part = UrlPart::PreQuery;
            }
            return next;
        }
    };
    for name in names {
        pipeline.push_func(*name);
    }
    next
}

fn value_filters(ctx: Context) -> &'static [&'static str] {
    match ctx.attr {
        AttrKind::Normal => &[],
        AttrKind::Script => &[filters::JS_VALUE],
        AttrKind::Style => &[filters::CSS],
        AttrKind::Url => match ctx.url_part {
            UrlPart::None => &[filters::URL_FILTER, filters::URL_NORMALIZE],
            UrlPart::PreQuery => &[filters::URL_NORMALIZE],
            UrlPart::QueryOrFrag => &[filters::URL_QUERY],
        },
    }
}

/// Context after two alternative paths meet
fn join(template: &str, a: Context, b: Context) -> Result<Context, EscapeError> {
    if a == b {
        return Ok(a);
    }
    // A URL that may or may not have reached its query is treated as query
    let (mut x, mut y) = (a, b);
    x.url_part = UrlPart::None;
    y.url_part = UrlPart::None;
    if x == y && a.attr == AttrKind::Url {
        return Ok(Context {
            url_part: UrlPart::QueryOrFrag,
            ..a
        });
    }
    Err(EscapeError::BranchContext {
        template: template.to_string(),
        left: a.to_string(),
        right: b.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::parser::ast::{Arg, Branch, Command};
    use crate::parser::parse;
    use crate::template::namespace::Registry;

    fn registry(text: &str) -> Registry {
        let mut registry = Registry::default();
        for tree in parse("page", text).expect("template parses") {
            let name = tree.name.clone();
            registry.insert(&name, Some(Arc::new(tree)));
        }
        registry
    }

    fn escape(registry: &mut Registry) -> Result<(), EscapeError> {
        HtmlEscaper.escape("page", &mut TemplateSet::new(registry))
    }

    /// Functions appended to the first action of the escaped tree
    fn appended(text: &str) -> Vec<String> {
        let mut reg = registry(text);
        escape(&mut reg).expect("escapes");
        let set = TemplateSet::new(&mut reg);
        let tree = set.tree("page").expect("tree present");
        let pipeline = tree
            .root
            .iter()
            .find_map(|n| match n {
                Node::Action(p) => Some(p.clone()),
                _ => None,
            })
            .expect("an action");
        pipeline.commands[1..]
            .iter()
            .filter_map(|c: &Command| match c.args.as_slice() {
                [Arg::Func(f)] => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_text_context() {
        assert_eq!(appended("<p>{{.}}</p>"), vec![filters::HTML]);
    }

    #[test]
    fn test_quoted_attribute() {
        assert_eq!(appended("<p title=\"{{.}}\">x</p>"), vec![filters::ATTR]);
        assert_eq!(appended("<p title={{.}}>x</p>"), vec![filters::ATTR_UNQUOTED]);
    }

    #[test]
    fn test_url_attribute() {
        assert_eq!(
            appended("<a href=\"{{.}}\">x</a>"),
            vec![filters::URL_FILTER, filters::URL_NORMALIZE, filters::ATTR]
        );
        assert_eq!(
            appended("<a href=\"/find?q={{.}}\">x</a>"),
            vec![filters::URL_QUERY, filters::ATTR]
        );
    }

    #[test]
    fn test_script_contexts() {
        assert_eq!(appended("<script>var x = {{.}};</script>"), vec![filters::JS_VALUE]);
        assert_eq!(
            appended("<b onclick=\"go({{.}})\">x</b>"),
            vec![filters::JS_VALUE, filters::ATTR]
        );
    }

    #[test]
    fn test_comment_action_removed() {
        let mut reg = registry("<!-- {{.secret}} -->ok");
        escape(&mut reg).expect("escapes");
        let set = TemplateSet::new(&mut reg);
        let tree = set.tree("page").expect("tree present");
        assert!(tree.root.iter().all(|n| matches!(n, Node::Text(_))));
    }

    #[test]
    fn test_unterminated_tag_rejected() {
        let mut reg = registry("<a href=\"{{.}}");
        let err = escape(&mut reg).expect_err("ends inside attribute");
        assert!(matches!(err, EscapeError::EndContext { .. }));
    }

    #[test]
    fn test_branches_must_agree() {
        let mut reg = registry("{{if .}}<a href=\"{{end}}x");
        let err = escape(&mut reg).expect_err("branches disagree");
        assert!(matches!(err, EscapeError::BranchContext { .. }));
    }

    #[test]
    fn test_range_body_must_loop() {
        let mut reg = registry("{{range .}}<b title=\"{{end}}");
        let err = escape(&mut reg).expect_err("range changes context");
        assert!(matches!(err, EscapeError::RangeLoop { .. }));
    }

    #[test]
    fn test_call_in_attribute_rejected() {
        let mut reg = registry(r#"{{define "v"}}x{{end}}<a title="{{template "v"}}">"#);
        let err = escape(&mut reg).expect_err("call inside attribute");
        assert!(matches!(err, EscapeError::CallContext { ref callee, .. } if callee == "v"));
    }

    #[test]
    fn test_callees_committed_with_root() {
        let mut reg = registry(r#"{{define "row"}}<td>{{.}}</td>{{end}}{{range .}}{{template "row" .}}{{end}}"#);
        escape(&mut reg).expect("escapes");
        let set = TemplateSet::new(&mut reg);
        assert_eq!(set.state("page"), Some(&EscapeState::Escaped));
        assert_eq!(set.state("row"), Some(&EscapeState::Escaped));
    }

    #[test]
    fn test_recursive_templates_tolerated() {
        let mut reg = registry(r#"{{define "tree"}}<li>{{.name}}{{range .kids}}{{template "tree" .}}{{end}}</li>{{end}}{{template "tree" .}}"#);
        escape(&mut reg).expect("escapes");
    }

    #[test]
    fn test_failing_callee_commits_nothing() {
        let mut reg = registry(r#"{{define "bad"}}<a href="{{end}}{{template "bad"}}"#);
        let err = escape(&mut reg).expect_err("callee fails");
        assert!(matches!(err, EscapeError::EndContext { ref template, .. } if template == "bad"));
        let set = TemplateSet::new(&mut reg);
        assert_eq!(set.state("page"), Some(&EscapeState::Unresolved));
        assert_eq!(set.state("bad"), Some(&EscapeState::Unresolved));
    }

    #[test]
    fn test_call_chain_depth_limited() {
        let mut text = String::from(r#"{{template "t0"}}"#);
        for i in 0..MAX_ESCAPE_DEPTH + 10 {
            text.push_str(&format!(r#"{{{{define "t{i}"}}}}{{{{template "t{}"}}}}{{{{end}}}}"#, i + 1));
        }
        let mut reg = registry(&text);
        let err = escape(&mut reg).expect_err("chain too deep");
        assert!(matches!(err, EscapeError::Depth { depth: MAX_ESCAPE_DEPTH, .. }));
        assert!(reg.iter().all(|slot| slot.state.is_unresolved()));
    }

    #[test]
    fn test_block_nesting_depth_limited() {
        let pipeline = match &parse("p", "{{if .}}{{end}}").expect("parses")[0].root[0] {
            Node::If(branch) => branch.pipeline.clone(),
            other => panic!("expected if, got {other:?}"),
        };
        let mut root = vec![Node::Text("x".to_string())];
        for _ in 0..MAX_ESCAPE_DEPTH + 1 {
            root = vec![Node::If(Branch {
                pipeline: pipeline.clone(),
                list: root,
                else_list: None,
            })];
        }
        let mut reg = Registry::default();
        reg.insert("page", Some(Arc::new(Tree::new("page", root))));
        assert!(matches!(escape(&mut reg), Err(EscapeError::Depth { .. })));
    }

    #[test]
    fn test_missing_callee() {
        let mut reg = registry(r#"{{template "ghost"}}"#);
        let err = escape(&mut reg).expect_err("no such template");
        assert!(matches!(err, EscapeError::NoSuchTemplate { ref callee, .. } if callee == "ghost"));
    }
}
