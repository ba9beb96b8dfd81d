//! Named templates sharing one namespace
//!
//! A [`Template`] is a cheap handle to one named entry of a shared
//! namespace. Every handle created from another (through [`Template::parse`],
//! [`Template::new_template`], [`Template::lookup`] and friends) shares the
//! same namespace. The first execution of any of them freezes the namespace:
//! nothing can be defined afterwards, and each template is escaped exactly
//! once before it produces output.
//!
//! # Example
//!
//! ```
//! use safe_templates::Template;
//! use serde_json::json;
//!
//! let page = Template::new("page");
//! page.parse(r#"{{define "item"}}<li>{{.}}</li>{{end}}<ul>{{range .}}{{template "item" .}}{{end}}</ul>"#)?;
//! let html = page.render(&json!(["<b>", "tea"]))?;
//! assert_eq!(html, "<ul><li>&lt;b&gt;</li><li>tea</li></ul>");
//! # Ok::<(), safe_templates::TemplateError>(())
//! ```

mod error;
mod files;
pub(crate) mod namespace;

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use serde::Serialize;

use crate::config::EngineConfig;
use crate::escape::{EscapeState, Escaper, HtmlEscaper};
use crate::exec::{self, Env, FuncMap, MissingKey};
use crate::parser::ast::Tree;
use crate::parser::Delims;

pub use error::TemplateError;
pub use files::{parse_files, parse_files_with, parse_glob};

use namespace::{Namespace, SlotId};

/// Handle to a named template
///
/// Cloning the handle does not copy the template; use
/// [`Template::deep_clone`] for an independent namespace.
#[derive(Clone)]
pub struct Template {
    ns: Arc<Namespace>,
    id: SlotId,
    name: Arc<str>,
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.name)
            .field("state", &self.escape_state())
            .finish()
    }
}

impl Template {
    /// New namespace holding one bodiless template, escaped for HTML
    pub fn new(name: &str) -> Self {
        Self::with_escaper(name, Arc::new(HtmlEscaper))
    }

    /// New namespace using a custom escaper
    pub fn with_escaper(name: &str, escaper: Arc<dyn Escaper>) -> Self {
        let ns = Namespace::new(escaper);
        let id = ns.with(|st| st.registry.insert(name, None));
        Self {
            ns: Arc::new(ns),
            id,
            name: Arc::from(name),
        }
    }

    fn handle(&self, id: SlotId, name: &str) -> Self {
        Self {
            ns: Arc::clone(&self.ns),
            id,
            name: Arc::from(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current tree, if the template has been given one
    pub fn tree(&self) -> Option<Arc<Tree>> {
        self.ns.with(|st| st.registry.slot(self.id).tree.clone())
    }

    pub fn escape_state(&self) -> EscapeState {
        self.ns.with(|st| st.registry.slot(self.id).state.clone())
    }

    /// Parse `text` as the body of this template
    ///
    /// `{{define}}` and `{{block}}` in the text become templates of their
    /// own in the same namespace; existing ones are redefined in place.
    pub fn parse(&self, text: &str) -> Result<Template, TemplateError> {
        self.ns.parse(&self.name, text)?;
        Ok(self.clone())
    }

    /// Register an already built tree under `name`
    pub fn add_parse_tree(&self, name: &str, mut tree: Tree) -> Result<Template, TemplateError> {
        tree.name = name.to_string();
        let id = self.ns.define(name, Some(tree))?;
        Ok(self.handle(id, name))
    }

    /// Declare a bodiless template `name` in this namespace
    ///
    /// An existing template of that name is reset to empty in place, so
    /// handles to it see the reset.
    pub fn new_template(&self, name: &str) -> Result<Template, TemplateError> {
        let id = self.ns.define(name, None)?;
        Ok(self.handle(id, name))
    }

    /// Execute this template, writing to `w`
    pub fn execute<W, T>(&self, w: &mut W, data: &T) -> Result<(), TemplateError>
    where
        W: Write + ?Sized,
        T: Serialize + ?Sized,
    {
        self.execute_template(w, &self.name, data)
    }

    /// Execute the template called `name` in this namespace
    pub fn execute_template<W, T>(&self, w: &mut W, name: &str, data: &T) -> Result<(), TemplateError>
    where
        W: Write + ?Sized,
        T: Serialize + ?Sized,
    {
        let prepared = self.ns.prepare(name)?;
        let data = serde_json::to_value(data)?;
        let env = Env {
            templates: &prepared.templates,
            funcs: &prepared.funcs,
            missing_key: prepared.missing_key,
        };
        exec::execute(&prepared.tree, &env, &data, w)?;
        Ok(())
    }

    /// Execute this template into a string
    pub fn render<T: Serialize + ?Sized>(&self, data: &T) -> Result<String, TemplateError> {
        self.render_template(&self.name, data)
    }

    pub fn render_template<T: Serialize + ?Sized>(
        &self,
        name: &str,
        data: &T,
    ) -> Result<String, TemplateError> {
        let mut buf = Vec::new();
        self.execute_template(&mut buf, name, data)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Copy the whole namespace, trees included
    ///
    /// Fails once any template in the namespace has been escaped. The copy
    /// starts unfrozen and shares nothing mutable with the original.
    pub fn deep_clone(&self) -> Result<Template, TemplateError> {
        let ns = self.ns.deep_clone(&self.name)?;
        Ok(Self {
            ns: Arc::new(ns),
            id: self.id,
            name: Arc::clone(&self.name),
        })
    }

    /// Template registered under `name`, if any
    pub fn lookup(&self, name: &str) -> Option<Template> {
        let id = self.ns.with(|st| st.registry.id(name))?;
        Some(self.handle(id, name))
    }

    /// Every template in the namespace, in definition order
    pub fn templates(&self) -> Vec<Template> {
        let entries: Vec<(SlotId, String)> = self.ns.with(|st| {
            st.registry
                .iter()
                .enumerate()
                .map(|(id, slot)| (id, slot.name.clone()))
                .collect()
        });
        entries
            .into_iter()
            .map(|(id, name)| self.handle(id, &name))
            .collect()
    }

    /// Names of templates with a body, for error messages
    ///
    /// Empty when there are none, otherwise `"; defined templates are: "`
    /// followed by the quoted names in sorted order.
    pub fn defined_templates(&self) -> String {
        let mut names: Vec<String> = self.ns.with(|st| {
            st.registry
                .iter()
                .filter(|slot| slot.tree.is_some())
                .map(|slot| format!("{:?}", slot.name))
                .collect()
        });
        if names.is_empty() {
            return String::new();
        }
        names.sort();
        format!("; defined templates are: {}", names.join(", "))
    }

    /// Set the action delimiters used by later parses
    pub fn delims(&self, left: &str, right: &str) -> &Self {
        self.ns
            .with(|st| st.settings.delims = Delims::new(left, right));
        self
    }

    /// Add custom functions, replacing any with the same name
    pub fn funcs(&self, funcs: FuncMap) -> &Self {
        self.ns
            .with(|st| Arc::make_mut(&mut st.settings.funcs).extend(funcs));
        self
    }

    /// Apply `key=value` options; only `missingkey` is recognised
    pub fn option(&self, options: &[&str]) -> Result<&Self, TemplateError> {
        for opt in options {
            let missing_key = match opt.split_once('=') {
                Some(("missingkey", value)) => value
                    .parse::<MissingKey>()
                    .map_err(|_| TemplateError::UnknownOption(opt.to_string()))?,
                _ => return Err(TemplateError::UnknownOption(opt.to_string())),
            };
            self.ns.with(|st| st.settings.missing_key = missing_key);
        }
        Ok(self)
    }

    pub fn apply_config(&self, config: &EngineConfig) -> &Self {
        self.ns.with(|st| {
            st.settings.delims = Delims::new(&config.left_delim, &config.right_delim);
            st.settings.missing_key = config.missing_key;
        });
        self
    }

    pub(crate) fn check_can_define(&self) -> Result<(), TemplateError> {
        self.ns.check_can_define(&self.name)
    }
}
