//! Safe Templates - HTML templates that are escaped exactly once before they run
//!
//! This library provides a template parser, an executor over JSON data, a
//! contextual HTML escaper, and the namespace that ties them together.
//! Templates that share a namespace can call each other; the first execution
//! freezes the namespace, escapes the template being run (and every template
//! it calls) once, and only then produces output.
//!
//! # Example
//!
//! ```rust
//! use safe_templates::render;
//! use serde_json::json;
//!
//! let html = render("<p title=\"{{.}}\">{{.}}</p>", &json!("a \"quote\" & <tag>")).unwrap();
//! assert_eq!(
//!     html,
//!     "<p title=\"a &#34;quote&#34; &amp; &lt;tag&gt;\">a &#34;quote&#34; &amp; &lt;tag&gt;</p>"
//! );
//! ```

pub mod config;
pub mod error;
pub mod escape;
pub mod exec;
pub mod parser;
pub mod template;

pub use config::{ConfigError, EngineConfig};
pub use error::ParseError;
pub use escape::{EscapeError, EscapeState, Escaper, HtmlEscaper, TemplateSet};
pub use exec::{func, ExecError, Func, FuncMap, MissingKey};
pub use parser::ast::Tree;
pub use template::{parse_files, parse_files_with, parse_glob, Template, TemplateError};

use serde::Serialize;

/// Name given to the template built by [`render`]
pub const DEFAULT_NAME: &str = "main";

/// Parse and execute `text` in one step
pub fn render<T: Serialize + ?Sized>(text: &str, data: &T) -> Result<String, TemplateError> {
    Template::new(DEFAULT_NAME).parse(text)?.render(data)
}
