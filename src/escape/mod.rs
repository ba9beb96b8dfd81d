//! Output-safety transform applied to templates before they may execute
//!
//! An [`Escaper`] rewrites a template's tree so every action's output is
//! sanitised for the context it lands in. It is handed a [`TemplateSet`], a
//! view of the namespace registry that is only ever constructed while the
//! namespace lock is held, so resolving callees never re-enters that lock.

mod context;
pub mod filters;
mod html;

use std::sync::Arc;

use thiserror::Error;

use crate::parser::ast::Tree;
use crate::template::namespace::{Registry, SlotId};

pub use context::{advance, AttrKind, Context, Delim, Element, State, UrlPart};
pub use html::{HtmlEscaper, MAX_ESCAPE_DEPTH};

/// Failure reported by an [`Escaper`]
///
/// Stored on the template and replayed verbatim on every later execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EscapeError {
    #[error("template {template:?} ends in a non-text context: {context}")]
    EndContext { template: String, context: String },

    #[error("template {template:?}: branches end in different contexts: {left}, {right}")]
    BranchContext {
        template: String,
        left: String,
        right: String,
    },

    #[error("template {template:?}: range body ends in {context}, expected {expected}")]
    RangeLoop {
        template: String,
        context: String,
        expected: String,
    },

    #[error("template {template:?}: cannot call template {callee:?} in {context}")]
    CallContext {
        template: String,
        callee: String,
        context: String,
    },

    #[error("template {template:?}: no such template {callee:?}")]
    NoSuchTemplate { template: String, callee: String },

    #[error("template {template:?}: called template {callee:?} failed to escape: {cause}")]
    Callee {
        template: String,
        callee: String,
        cause: Box<EscapeError>,
    },

    #[error("template {template:?}: exceeded maximum nesting depth ({depth})")]
    Depth { template: String, depth: usize },

    #[error("template {template:?}: {message}")]
    Rejected { template: String, message: String },
}

impl EscapeError {
    /// Generic rejection, for escapers with their own rules
    pub fn rejected(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            template: template.into(),
            message: message.into(),
        }
    }

    /// Name of the template the error was raised for
    pub fn template(&self) -> &str {
        match self {
            Self::EndContext { template, .. }
            | Self::BranchContext { template, .. }
            | Self::RangeLoop { template, .. }
            | Self::CallContext { template, .. }
            | Self::NoSuchTemplate { template, .. }
            | Self::Callee { template, .. }
            | Self::Depth { template, .. }
            | Self::Rejected { template, .. } => template,
        }
    }
}

/// Sticky outcome of escaping one template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EscapeState {
    /// Not yet escaped; the template may still be redefined or cloned
    #[default]
    Unresolved,
    /// Escaped; eligible for execution
    Escaped,
    /// Escaping failed; the error is returned on every execution attempt
    Failed(EscapeError),
}

impl EscapeState {
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved)
    }

    pub fn is_escaped(&self) -> bool {
        matches!(self, Self::Escaped)
    }
}

/// Context-sensitive rewrite of a template tree
///
/// Called at most once per template, with the namespace lock held. The
/// implementation must commit the rewritten tree of every template it
/// escapes through [`TemplateSet::commit`]; the executing template is marked
/// escaped by the caller if the escaper returns `Ok` without committing it.
/// If it returns `Err`, every commit it made is rolled back.
pub trait Escaper: Send + Sync {
    fn escape(&self, name: &str, set: &mut TemplateSet<'_>) -> Result<(), EscapeError>;

    /// Escaper for a cloned namespace
    ///
    /// `None` shares this escaper with the clone, which is only sound for
    /// escapers that keep no per-namespace state.
    fn fork(&self) -> Option<Arc<dyn Escaper>> {
        None
    }
}

impl<E: Escaper + ?Sized> Escaper for Arc<E> {
    fn escape(&self, name: &str, set: &mut TemplateSet<'_>) -> Result<(), EscapeError> {
        (**self).escape(name, set)
    }

    fn fork(&self) -> Option<Arc<dyn Escaper>> {
        (**self).fork()
    }
}

/// Name resolution over a locked namespace registry
///
/// Commits are journalled so that a failed escape can be undone as a whole.
pub struct TemplateSet<'a> {
    registry: &'a mut Registry,
    /// Trees replaced by `commit`, oldest first
    journal: Vec<(SlotId, Option<Arc<Tree>>)>,
}

impl<'a> TemplateSet<'a> {
    pub(crate) fn new(registry: &'a mut Registry) -> Self {
        Self {
            registry,
            journal: Vec::new(),
        }
    }

    /// Check if a template is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.registry.get(name).is_some()
    }

    /// Current tree of a template, if it has a body
    pub fn tree(&self, name: &str) -> Option<&Tree> {
        self.registry.get(name).and_then(|slot| slot.tree.as_deref())
    }

    /// Escape state of a template
    pub fn state(&self, name: &str) -> Option<&EscapeState> {
        self.registry.get(name).map(|slot| &slot.state)
    }

    /// All registered names, in registration order
    pub fn names(&self) -> Vec<&str> {
        self.registry.iter().map(|slot| slot.name.as_str()).collect()
    }

    /// Install a rewritten tree and mark the template escaped
    ///
    /// Only an unresolved template can be committed; returns whether the
    /// commit took effect.
    pub fn commit(&mut self, name: &str, tree: Tree) -> bool {
        let Some(id) = self.registry.id(name) else {
            return false;
        };
        let slot = self.registry.slot_mut(id);
        if !slot.state.is_unresolved() {
            return false;
        }
        let previous = slot.tree.replace(Arc::new(tree));
        slot.state = EscapeState::Escaped;
        self.journal.push((id, previous));
        tracing::debug!(template = %name, "template escaped");
        true
    }

    /// Restore every tree committed through this set and mark those
    /// templates unresolved again
    pub(crate) fn rollback(self) {
        for (id, previous) in self.journal.into_iter().rev() {
            let slot = self.registry.slot_mut(id);
            slot.tree = previous;
            slot.state = EscapeState::Unresolved;
            tracing::debug!(template = %slot.name, "escape commit rolled back");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ast::Node;

    fn registry_with(names: &[&str]) -> Registry {
        let mut registry = Registry::default();
        for name in names {
            registry.insert(
                name,
                Some(Arc::new(Tree::new(*name, vec![Node::Text("x".to_string())]))),
            );
        }
        registry
    }

    #[test]
    fn test_set_reads_registry() {
        let mut registry = registry_with(&["a", "b"]);
        let set = TemplateSet::new(&mut registry);
        assert!(set.contains("a"));
        assert!(!set.contains("c"));
        assert_eq!(set.names(), vec!["a", "b"]);
        assert_eq!(set.state("b"), Some(&EscapeState::Unresolved));
        assert!(set.tree("a").is_some());
    }

    #[test]
    fn test_commit_only_from_unresolved() {
        let mut registry = registry_with(&["a"]);
        let mut set = TemplateSet::new(&mut registry);
        let tree = Tree::new("a", vec![Node::Text("y".to_string())]);
        assert!(set.commit("a", tree.clone()));
        assert_eq!(set.state("a"), Some(&EscapeState::Escaped));
        assert!(!set.commit("a", tree.clone()));
        assert!(!set.commit("missing", tree));
    }

    #[test]
    fn test_rollback_restores_committed_trees() {
        let mut registry = registry_with(&["a", "b"]);
        let mut set = TemplateSet::new(&mut registry);
        assert!(set.commit("a", Tree::new("a", vec![Node::Text("rewritten".to_string())])));
        assert!(set.commit("b", Tree::new("b", vec![])));
        set.rollback();

        for name in ["a", "b"] {
            let slot = registry.get(name).expect("registered");
            assert_eq!(slot.state, EscapeState::Unresolved);
            assert_eq!(
                slot.tree.as_ref().map(|t| t.root.clone()),
                Some(vec![Node::Text("x".to_string())])
            );
        }
    }

    #[test]
    fn test_error_template_accessor() {
        let err = EscapeError::rejected("page", "nope");
        assert_eq!(err.template(), "page");
        assert!(err.to_string().contains("nope"));
    }
}
