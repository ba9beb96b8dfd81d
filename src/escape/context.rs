//! HTML output context tracking
//!
//! A [`Context`] describes where in an HTML document the next byte of output
//! lands. [`advance`] moves a context across literal template text.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Ordinary HTML text
    Text,
    /// Inside a start tag, between attributes
    Tag,
    /// Inside an attribute name
    AttrName,
    /// After an attribute name, before any `=`
    AfterName,
    /// After `=`, before the value starts
    BeforeValue,
    /// Inside an attribute value
    AttrValue,
    /// Inside a `<script>` element body
    Script,
    /// Inside a `<style>` element body
    Style,
    /// Inside `<!-- ... -->`
    Comment,
}

/// How an attribute value is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delim {
    None,
    Double,
    Single,
    Space,
}

/// What kind of content an attribute value holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Normal,
    Url,
    Script,
    Style,
}

/// Element whose body gets special treatment once the tag closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Element {
    None,
    Script,
    Style,
}

/// Position within a URL attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlPart {
    None,
    PreQuery,
    QueryOrFrag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub state: State,
    pub delim: Delim,
    pub attr: AttrKind,
    pub element: Element,
    pub url_part: UrlPart,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            state: State::Text,
            delim: Delim::None,
            attr: AttrKind::Normal,
            element: Element::None,
            url_part: UrlPart::None,
        }
    }
}

impl Context {
    fn with_state(state: State) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    /// Context just inside a start tag for `element`
    fn tag(element: Element) -> Self {
        Self {
            element,
            ..Self::with_state(State::Tag)
        }
    }

    /// Context after the `>` of a start tag
    fn close_tag(self) -> Self {
        match self.element {
            Element::Script => Self::with_state(State::Script),
            Element::Style => Self::with_state(State::Style),
            Element::None => Self::default(),
        }
    }

    /// Back between attributes, keeping the element
    fn next_attr(self) -> Self {
        Self::tag(self.element)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            State::Text => write!(f, "text"),
            State::Tag => write!(f, "tag"),
            State::AttrName => write!(f, "attribute name"),
            State::AfterName => write!(f, "after attribute name"),
            State::BeforeValue => write!(f, "before attribute value"),
            State::Script => write!(f, "script"),
            State::Style => write!(f, "style"),
            State::Comment => write!(f, "HTML comment"),
            State::AttrValue => {
                let delim = match self.delim {
                    Delim::Double => "double-quoted",
                    Delim::Single => "single-quoted",
                    Delim::Space | Delim::None => "unquoted",
                };
                let kind = match (self.attr, self.url_part) {
                    (AttrKind::Normal, _) => "",
                    (AttrKind::Url, UrlPart::QueryOrFrag) => ", url query",
                    (AttrKind::Url, _) => ", url",
                    (AttrKind::Script, _) => ", script",
                    (AttrKind::Style, _) => ", style",
                };
                write!(f, "attribute value ({}{})", delim, kind)
            }
        }
    }
}

const URL_ATTRS: &[&str] = &[
    "action",
    "archive",
    "background",
    "cite",
    "classid",
    "codebase",
    "data",
    "formaction",
    "href",
    "icon",
    "longdesc",
    "manifest",
    "poster",
    "profile",
    "src",
    "usemap",
    "xmlns",
];

/// Classify an attribute by name
pub fn attr_kind(name: &str) -> AttrKind {
    let name = name.to_ascii_lowercase();
    let local = match name.split_once(':') {
        Some((_, local)) if !local.is_empty() => local,
        _ => name.as_str(),
    };
    if local.starts_with("on") {
        AttrKind::Script
    } else if local == "style" {
        AttrKind::Style
    } else if URL_ATTRS.contains(&local) {
        AttrKind::Url
    } else {
        AttrKind::Normal
    }
}

fn is_name_byte(b: u8) -> bool {
    !(b.is_ascii_whitespace() || b == b'=' || b == b'>' || b == b'/')
}

fn skip_space(s: &str) -> usize {
    s.bytes().take_while(|b| b.is_ascii_whitespace()).count()
}

/// Context after emitting `text` starting from `ctx`
pub fn advance(mut ctx: Context, text: &str) -> Context {
    let mut rest = text;
    while !rest.is_empty() {
        let (next, consumed) = step(ctx, rest);
        ctx = next;
        rest = &rest[consumed..];
    }
    ctx
}

/// One transition; consumes at least one byte unless the state changes
fn step(ctx: Context, s: &str) -> (Context, usize) {
    let bytes = s.as_bytes();
    match ctx.state {
        State::Text => {
            let Some(i) = s.find('<') else {
                return (ctx, s.len());
            };
            let after = &s[i..];
            if after.starts_with("<!--") {
                return (Context::with_state(State::Comment), i + 4);
            }
            if after.starts_with("</") {
                let end = after.find('>').map_or(s.len(), |j| i + j + 1);
                return (ctx, end);
            }
            let name_len = after[1..]
                .bytes()
                .take_while(|b| b.is_ascii_alphanumeric())
                .count();
            if name_len == 0 {
                return (ctx, i + 1);
            }
            let name = &after[1..1 + name_len];
            let element = if name.eq_ignore_ascii_case("script") {
                Element::Script
            } else if name.eq_ignore_ascii_case("style") {
                Element::Style
            } else {
                Element::None
            };
            (Context::tag(element), i + 1 + name_len)
        }
        State::Comment => match s.find("-->") {
            Some(i) => (Context::default(), i + 3),
            None => (ctx, s.len()),
        },
        State::Tag => {
            let i = bytes
                .iter()
                .take_while(|b| b.is_ascii_whitespace() || **b == b'/')
                .count();
            if i == s.len() {
                return (ctx, i);
            }
            if bytes[i] == b'>' {
                return (ctx.close_tag(), i + 1);
            }
            let len = bytes[i..].iter().take_while(|b| is_name_byte(**b)).count().max(1);
            let name = &s[i..i + len];
            let state = if i + len == s.len() {
                State::AttrName
            } else {
                State::AfterName
            };
            let next = Context {
                state,
                attr: attr_kind(name),
                ..ctx
            };
            (next, i + len)
        }
        State::AttrName => {
            let len = bytes.iter().take_while(|b| is_name_byte(**b)).count();
            if len == s.len() {
                (ctx, len)
            } else {
                (Context { state: State::AfterName, ..ctx }, len)
            }
        }
        State::AfterName => {
            let i = skip_space(s);
            if i == s.len() {
                return (ctx, i);
            }
            match bytes[i] {
                b'=' => (Context { state: State::BeforeValue, ..ctx }, i + 1),
                b'>' => (ctx.close_tag(), i + 1),
                _ => (ctx.next_attr(), i),
            }
        }
        State::BeforeValue => {
            let i = skip_space(s);
            if i == s.len() {
                return (ctx, i);
            }
            let value = |delim| Context {
                state: State::AttrValue,
                delim,
                ..ctx
            };
            match bytes[i] {
                b'"' => (value(Delim::Double), i + 1),
                b'\'' => (value(Delim::Single), i + 1),
                b'>' => (ctx.close_tag(), i + 1),
                _ => (value(Delim::Space), i),
            }
        }
        State::AttrValue => {
            let end = match ctx.delim {
                Delim::Double => s.find('"'),
                Delim::Single => s.find('\''),
                Delim::Space | Delim::None => {
                    s.find(|c: char| c.is_ascii_whitespace() || c == '>')
                }
            };
            let value = &s[..end.unwrap_or(s.len())];
            let mut next = ctx;
            if ctx.attr == AttrKind::Url {
                if value.contains(['?', '#']) {
                    next.url_part = UrlPart::QueryOrFrag;
                } else if !value.is_empty() && next.url_part == UrlPart::None {
                    next.url_part = UrlPart::PreQuery;
                }
            }
            match end {
                None => (next, s.len()),
                Some(i) if bytes[i] == b'>' => (ctx.close_tag(), i + 1),
                Some(i) => (ctx.next_attr(), i + 1),
            }
        }
        State::Script => end_of_raw(ctx, s, "</script"),
        State::Style => end_of_raw(ctx, s, "</style"),
    }
}

/// Scan a raw-text element body for its closing tag
fn end_of_raw(ctx: Context, s: &str, close: &str) -> (Context, usize) {
    match s.to_ascii_lowercase().find(close) {
        Some(i) => (Context::tag(Element::None), i + close.len()),
        None => (ctx, s.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn after(text: &str) -> Context {
        advance(Context::default(), text)
    }

    #[test]
    fn test_plain_text_stays_text() {
        assert_eq!(after("hello <b>world</b>!"), Context::default());
    }

    #[test]
    fn test_open_tag() {
        assert_eq!(after("<a ").state, State::Tag);
        assert_eq!(after("<a>").state, State::Text);
    }

    #[test]
    fn test_quoted_url_attribute() {
        let ctx = after("<a href=\"");
        assert_eq!(ctx.state, State::AttrValue);
        assert_eq!(ctx.delim, Delim::Double);
        assert_eq!(ctx.attr, AttrKind::Url);
        assert_eq!(ctx.url_part, UrlPart::None);
    }

    #[test]
    fn test_url_query_part() {
        let ctx = after("<a href='/search?q=");
        assert_eq!(ctx.delim, Delim::Single);
        assert_eq!(ctx.url_part, UrlPart::QueryOrFrag);

        let ctx = after("<img src=\"/static/");
        assert_eq!(ctx.url_part, UrlPart::PreQuery);
    }

    #[test]
    fn test_unquoted_attribute() {
        let ctx = after("<input value=");
        assert_eq!(ctx.state, State::BeforeValue);
        let ctx = after("<input value=x");
        assert_eq!(ctx.state, State::AttrValue);
        assert_eq!(ctx.delim, Delim::Space);
        assert_eq!(after("<input value=x>").state, State::Text);
    }

    #[test]
    fn test_closed_attribute_back_to_tag() {
        let ctx = after("<a title=\"x\" ");
        assert_eq!(ctx.state, State::Tag);
        assert_eq!(after("<a title=\"x\">").state, State::Text);
    }

    #[test]
    fn test_event_handler_is_script() {
        assert_eq!(after("<button onclick=\"").attr, AttrKind::Script);
        assert_eq!(after("<p style=\"").attr, AttrKind::Style);
    }

    #[test]
    fn test_script_element() {
        assert_eq!(after("<script>var x = ").state, State::Script);
        assert_eq!(after("<script>var x = 1;</script>").state, State::Text);
        assert_eq!(after("<SCRIPT type=\"module\">").state, State::Script);
    }

    #[test]
    fn test_style_element() {
        assert_eq!(after("<style>p { color: ").state, State::Style);
        assert_eq!(after("<style></style>").state, State::Text);
    }

    #[test]
    fn test_comment() {
        assert_eq!(after("<!-- note ").state, State::Comment);
        assert_eq!(after("<!-- note -->").state, State::Text);
    }

    #[test]
    fn test_attr_kind() {
        assert_eq!(attr_kind("HREF"), AttrKind::Url);
        assert_eq!(attr_kind("xlink:href"), AttrKind::Url);
        assert_eq!(attr_kind("onload"), AttrKind::Script);
        assert_eq!(attr_kind("title"), AttrKind::Normal);
    }

    #[test]
    fn test_display() {
        assert_eq!(Context::default().to_string(), "text");
        assert_eq!(
            after("<a href=\"").to_string(),
            "attribute value (double-quoted, url)"
        );
        assert_eq!(after("<script>").to_string(), "script");
    }
}
