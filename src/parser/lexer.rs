//! Lexer for template text
//!
//! Delimiters are configurable per namespace, so text is first split into
//! literal runs and action bodies by a small scanner, and each action body is
//! then tokenized with logos.

use logos::Logos;

use crate::error::ParseError;

pub use super::ast::Span;

pub const DEFAULT_LEFT_DELIM: &str = "{{";
pub const DEFAULT_RIGHT_DELIM: &str = "}}";

/// Action delimiters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delims {
    pub left: String,
    pub right: String,
}

impl Default for Delims {
    fn default() -> Self {
        Self {
            left: DEFAULT_LEFT_DELIM.to_string(),
            right: DEFAULT_RIGHT_DELIM.to_string(),
        }
    }
}

impl Delims {
    /// Empty strings fall back to the defaults
    pub fn new(left: &str, right: &str) -> Self {
        Self {
            left: if left.is_empty() {
                DEFAULT_LEFT_DELIM
            } else {
                left
            }
            .to_string(),
            right: if right.is_empty() {
                DEFAULT_RIGHT_DELIM
            } else {
                right
            }
            .to_string(),
        }
    }
}

/// Tokens inside an action body
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
pub enum Token {
    // Keywords
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("end")]
    End,
    #[token("range")]
    Range,
    #[token("with")]
    With,
    #[token("define")]
    Define,
    #[token("template")]
    Template,
    #[token("block")]
    Block,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("nil")]
    Nil,

    #[token("|")]
    Pipe,
    #[token("(")]
    ParenOpen,
    #[token(")")]
    ParenClose,

    #[token(".")]
    Dot,

    #[regex(r"(\.[a-zA-Z_][a-zA-Z0-9_]*)+", |lex| field_path(lex.slice()))]
    Field(Vec<String>),

    #[regex(r"\$(\.[a-zA-Z_][a-zA-Z0-9_]*)*", |lex| field_path(&lex.slice()[1..]))]
    Root(Vec<String>),

    // Identifiers must come after keywords
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string(), priority = 1)]
    Ident(String),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| unquote(lex.slice()))]
    #[regex(r"`[^`]*`", |lex| {
        let s = lex.slice();
        s[1..s.len()-1].to_string()
    })]
    String(String),

    #[regex(r"-?[0-9]+(\.[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),
}

/// Stream element handed to the grammar
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// Literal text between actions
    Text(String),
    /// Left delimiter
    Open,
    /// Right delimiter
    Close,
    Tok(Token),
}

fn field_path(s: &str) -> Vec<String> {
    s.split('.')
        .filter(|seg| !seg.is_empty())
        .map(str::to_string)
        .collect()
}

fn unquote(s: &str) -> String {
    let inner = &s[1..s.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Split template text into items with byte spans
pub fn lex(input: &str, delims: &Delims) -> Result<Vec<(Item, Span)>, ParseError> {
    let left = delims.left.as_str();
    let right = delims.right.as_str();
    let mut items = Vec::new();
    let mut pos = 0;
    let mut trim_next = false;

    while pos < input.len() {
        let Some(rel) = input[pos..].find(left) else {
            push_text(&mut items, &input[pos..], pos, trim_next, false);
            break;
        };
        let open = pos + rel;
        let mut body_start = open + left.len();
        let trim_left = has_trim_marker(&input[body_start..]);
        push_text(&mut items, &input[pos..open], pos, trim_next, trim_left);
        if trim_left {
            body_start += 1;
        }

        let inner = &input[body_start..];
        let leading = inner.len() - inner.trim_start().len();
        if inner[leading..].starts_with("/*") {
            let (end, trim_right) = scan_comment(input, body_start + leading, right)?;
            pos = end;
            trim_next = trim_right;
            continue;
        }

        let close = find_close(input, body_start, right).ok_or_else(|| ParseError::Unclosed {
            span: open..input.len(),
            what: "action".to_string(),
        })?;

        let mut body_end = close;
        let body = &input[body_start..close];
        let trim_right = is_trimmed_right(body);
        if trim_right {
            body_end -= 1;
        }

        items.push((Item::Open, open..body_start));
        lex_action(&mut items, &input[body_start..body_end], body_start)?;
        items.push((Item::Close, close..close + right.len()));

        pos = close + right.len();
        trim_next = trim_right;
    }

    Ok(items)
}

fn push_text(
    items: &mut Vec<(Item, Span)>,
    text: &str,
    offset: usize,
    trim_start: bool,
    trim_end: bool,
) {
    let mut start = offset;
    let mut s = text;
    if trim_start {
        let trimmed = s.trim_start();
        start += s.len() - trimmed.len();
        s = trimmed;
    }
    if trim_end {
        s = s.trim_end();
    }
    if !s.is_empty() {
        items.push((Item::Text(s.to_string()), start..start + s.len()));
    }
}

/// `-` directly after the left delimiter, followed by whitespace
fn has_trim_marker(rest: &str) -> bool {
    let mut chars = rest.chars();
    chars.next() == Some('-') && chars.next().is_some_and(|c| c.is_ascii_whitespace())
}

/// Whitespace then `-` directly before the right delimiter
fn is_trimmed_right(body: &str) -> bool {
    match body.strip_suffix('-') {
        Some(before) => before.ends_with(|c: char| c.is_ascii_whitespace()),
        None => false,
    }
}

/// Position of the right delimiter, skipping over quoted strings
fn find_close(input: &str, from: usize, right: &str) -> Option<usize> {
    let bytes = input.as_bytes();
    let right = right.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        if bytes[i..].starts_with(right) {
            return Some(i);
        }
        match bytes[i] {
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'`' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'`' {
                    i += 1;
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    None
}

/// Returns the position after the closing delimiter and whether it trims
fn scan_comment(input: &str, start: usize, right: &str) -> Result<(usize, bool), ParseError> {
    let unclosed = || ParseError::Unclosed {
        span: start..input.len(),
        what: "comment".to_string(),
    };
    let end = input[start + 2..].find("*/").ok_or_else(unclosed)? + start + 4;
    let rest = &input[end..];
    let skipped = rest.len() - rest.trim_start().len();
    let rest = &rest[skipped..];
    if let Some(after) = rest.strip_prefix('-') {
        if after.starts_with(right) && skipped > 0 {
            return Ok((end + skipped + 1 + right.len(), true));
        }
    }
    if rest.starts_with(right) {
        return Ok((end + skipped + right.len(), false));
    }
    Err(ParseError::Syntax {
        span: start..end,
        message: "comment ends before closing delimiter".to_string(),
        expected: vec![format!("'{}'", right)],
    })
}

fn lex_action(
    items: &mut Vec<(Item, Span)>,
    body: &str,
    offset: usize,
) -> Result<(), ParseError> {
    for (tok, span) in Token::lexer(body).spanned() {
        let span = offset + span.start..offset + span.end;
        match tok {
            Ok(t) => items.push((Item::Tok(t), span)),
            Err(()) => {
                return Err(ParseError::Syntax {
                    message: format!(
                        "unexpected character {:?} in action",
                        &body[span.start - offset..span.end - offset]
                    ),
                    span,
                    expected: vec![],
                })
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(input: &str) -> Vec<Item> {
        lex(input, &Delims::default())
            .expect("Should lex")
            .into_iter()
            .map(|(i, _)| i)
            .collect()
    }

    fn tokens(body: &str) -> Vec<Token> {
        Token::lexer(body).filter_map(|t| t.ok()).collect()
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(items("hello"), vec![Item::Text("hello".to_string())]);
    }

    #[test]
    fn test_text_and_action() {
        assert_eq!(
            items("Hi {{.name}}!"),
            vec![
                Item::Text("Hi ".to_string()),
                Item::Open,
                Item::Tok(Token::Field(vec!["name".to_string()])),
                Item::Close,
                Item::Text("!".to_string()),
            ]
        );
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            tokens("if else end range with define template block"),
            vec![
                Token::If,
                Token::Else,
                Token::End,
                Token::Range,
                Token::With,
                Token::Define,
                Token::Template,
                Token::Block
            ]
        );
    }

    #[test]
    fn test_fields_and_root() {
        assert_eq!(
            tokens(". .a.b $ $.c"),
            vec![
                Token::Dot,
                Token::Field(vec!["a".to_string(), "b".to_string()]),
                Token::Root(vec![]),
                Token::Root(vec!["c".to_string()]),
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            tokens(r#""a\"b" `raw\n` 42 -1.5 true nil"#),
            vec![
                Token::String("a\"b".to_string()),
                Token::String("raw\\n".to_string()),
                Token::Number(42.0),
                Token::Number(-1.5),
                Token::True,
                Token::Nil,
            ]
        );
    }

    #[test]
    fn test_pipe_and_parens() {
        assert_eq!(
            tokens("(len .) | printf"),
            vec![
                Token::ParenOpen,
                Token::Ident("len".to_string()),
                Token::Dot,
                Token::ParenClose,
                Token::Pipe,
                Token::Ident("printf".to_string()),
            ]
        );
    }

    #[test]
    fn test_identifier_with_keyword_prefix() {
        assert_eq!(tokens("ifx"), vec![Token::Ident("ifx".to_string())]);
    }

    #[test]
    fn test_trim_markers() {
        assert_eq!(
            items("a  {{- .x -}}  b"),
            vec![
                Item::Text("a".to_string()),
                Item::Open,
                Item::Tok(Token::Field(vec!["x".to_string()])),
                Item::Close,
                Item::Text("b".to_string()),
            ]
        );
    }

    #[test]
    fn test_negative_number_is_not_trim() {
        assert_eq!(
            items("a {{-3}}"),
            vec![
                Item::Text("a ".to_string()),
                Item::Open,
                Item::Tok(Token::Number(-3.0)),
                Item::Close,
            ]
        );
    }

    #[test]
    fn test_comment_dropped() {
        assert_eq!(
            items("a{{/* note */}}b"),
            vec![Item::Text("a".to_string()), Item::Text("b".to_string())]
        );
    }

    #[test]
    fn test_comment_with_trim() {
        assert_eq!(
            items("a {{- /* note */ -}} b"),
            vec![Item::Text("a".to_string()), Item::Text("b".to_string())]
        );
    }

    #[test]
    fn test_delimiter_inside_string() {
        let out = items(r#"{{"}}"}}"#);
        assert_eq!(
            out,
            vec![
                Item::Open,
                Item::Tok(Token::String("}}".to_string())),
                Item::Close
            ]
        );
    }

    #[test]
    fn test_custom_delims() {
        let out: Vec<Item> = lex("<%.x%>{{y}}", &Delims::new("<%", "%>"))
            .expect("Should lex")
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        assert_eq!(
            out,
            vec![
                Item::Open,
                Item::Tok(Token::Field(vec!["x".to_string()])),
                Item::Close,
                Item::Text("{{y}}".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_delims_fall_back() {
        assert_eq!(Delims::new("", ""), Delims::default());
    }

    #[test]
    fn test_unclosed_action() {
        let err = lex("a {{ .x", &Delims::default()).unwrap_err();
        assert!(matches!(err, ParseError::Unclosed { .. }));
    }

    #[test]
    fn test_unclosed_comment() {
        let err = lex("{{/* never", &Delims::default()).unwrap_err();
        assert!(matches!(err, ParseError::Unclosed { .. }));
    }

    #[test]
    fn test_bad_character() {
        let err = lex("{{ .x # }}", &Delims::default()).unwrap_err();
        assert!(matches!(err, ParseError::Syntax { .. }));
    }

    #[test]
    fn test_spans_point_into_source() {
        let src = "ab{{.x}}";
        let out = lex(src, &Delims::default()).expect("Should lex");
        assert_eq!(out[0].1, 0..2);
        assert_eq!(out[1].1, 2..4);
        assert_eq!(&src[out[2].1.clone()], ".x");
        assert_eq!(out[3].1, 6..8);
    }
}
