//! Shared registry of named templates
//!
//! A [`Namespace`] owns every template defined through handles that share it.
//! Templates live in an arena of [`Slot`]s addressed by stable ids, so
//! redefining a name rewrites the slot a handle already points at. One
//! `parking_lot::Mutex` guards the registry and the escaping flag; each
//! public operation does its whole check-and-mutate sequence under a single
//! acquisition.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::TemplateError;
use crate::escape::{filters, EscapeState, Escaper, TemplateSet};
use crate::exec::{is_builtin, FuncMap, MissingKey};
use crate::parser::ast::Tree;
use crate::parser::{self, Delims};

/// Stable index of a slot in its namespace
pub(crate) type SlotId = usize;

/// One named template: its tree and sticky escape outcome
#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub(crate) name: String,
    pub(crate) tree: Option<Arc<Tree>>,
    pub(crate) state: EscapeState,
}

impl Slot {
    fn has_body(&self) -> bool {
        self.tree.as_ref().is_some_and(|t| !t.is_empty())
    }
}

/// Name to slot mapping; slots are never removed
#[derive(Debug, Default)]
pub(crate) struct Registry {
    slots: Vec<Slot>,
    index: HashMap<String, SlotId>,
}

impl Registry {
    pub(crate) fn id(&self, name: &str) -> Option<SlotId> {
        self.index.get(name).copied()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Slot> {
        self.id(name).map(|id| &self.slots[id])
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Slot> {
        self.id(name).map(|id| &mut self.slots[id])
    }

    pub(crate) fn slot(&self, id: SlotId) -> &Slot {
        &self.slots[id]
    }

    pub(crate) fn slot_mut(&mut self, id: SlotId) -> &mut Slot {
        &mut self.slots[id]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    /// Register `name`, resetting an existing slot in place
    pub(crate) fn insert(&mut self, name: &str, tree: Option<Arc<Tree>>) -> SlotId {
        if let Some(id) = self.id(name) {
            let slot = &mut self.slots[id];
            slot.tree = tree;
            slot.state = EscapeState::Unresolved;
            return id;
        }
        let id = self.slots.len();
        self.slots.push(Slot {
            name: name.to_string(),
            tree,
            state: EscapeState::Unresolved,
        });
        self.index.insert(name.to_string(), id);
        id
    }

    /// Merge a freshly parsed tree
    ///
    /// An empty tree never replaces one that already has a body.
    fn sync(&mut self, tree: Tree) -> SlotId {
        if let Some(id) = self.id(&tree.name) {
            if tree.is_empty() && self.slots[id].has_body() {
                return id;
            }
        }
        let name = tree.name.clone();
        self.insert(&name, Some(Arc::new(tree)))
    }
}

/// Engine settings forwarded to parsing and execution
#[derive(Clone, Default)]
pub(crate) struct Settings {
    pub(crate) delims: Delims,
    pub(crate) funcs: Arc<FuncMap>,
    pub(crate) missing_key: MissingKey,
}

pub(crate) struct NamespaceState {
    pub(crate) registry: Registry,
    /// Set by the first execution request; never cleared
    escaped: bool,
    pub(crate) settings: Settings,
}

/// Everything an execution needs once the gate has been passed
pub(crate) struct Prepared {
    pub(crate) tree: Arc<Tree>,
    pub(crate) templates: HashMap<String, Arc<Tree>>,
    pub(crate) funcs: Arc<FuncMap>,
    pub(crate) missing_key: MissingKey,
}

pub(crate) struct Namespace {
    state: Mutex<NamespaceState>,
    escaper: Arc<dyn Escaper>,
}

impl Namespace {
    pub(crate) fn new(escaper: Arc<dyn Escaper>) -> Self {
        Self::with_state(escaper, Registry::default(), Settings::default())
    }

    fn with_state(escaper: Arc<dyn Escaper>, registry: Registry, settings: Settings) -> Self {
        Self {
            state: Mutex::new(NamespaceState {
                registry,
                escaped: false,
                settings,
            }),
            escaper,
        }
    }

    /// Run `f` with the namespace locked
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut NamespaceState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Fail if definitions are frozen
    pub(crate) fn check_can_define(&self, name: &str) -> Result<(), TemplateError> {
        if self.state.lock().escaped {
            return Err(TemplateError::DefinitionAfterExecution {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Register `name` with the given tree, or none for a bodiless template
    pub(crate) fn define(&self, name: &str, tree: Option<Tree>) -> Result<SlotId, TemplateError> {
        let mut st = self.state.lock();
        if st.escaped {
            return Err(TemplateError::DefinitionAfterExecution {
                name: name.to_string(),
            });
        }
        let id = st.registry.insert(name, tree.map(Arc::new));
        tracing::debug!(template = %name, "template defined");
        Ok(id)
    }

    /// Parse `text` as the body of `name`, syncing every tree it defines
    pub(crate) fn parse(&self, name: &str, text: &str) -> Result<SlotId, TemplateError> {
        let (delims, funcs) = {
            let st = self.state.lock();
            if st.escaped {
                return Err(TemplateError::DefinitionAfterExecution {
                    name: name.to_string(),
                });
            }
            (st.settings.delims.clone(), Arc::clone(&st.settings.funcs))
        };

        let trees = parser::parse_with(name, text, &delims, |f| {
            filters::is_filter(f) || funcs.contains_key(f) || is_builtin(f)
        })
        .map_err(|errors| TemplateError::Parse {
            name: name.to_string(),
            text: text.to_string(),
            errors,
        })?;

        let mut st = self.state.lock();
        if st.escaped {
            return Err(TemplateError::DefinitionAfterExecution {
                name: name.to_string(),
            });
        }
        let mut root = None;
        for tree in trees {
            let tree_name = tree.name.clone();
            let id = st.registry.sync(tree);
            tracing::debug!(template = %tree_name, "template defined");
            if tree_name == name {
                root = Some(id);
            }
        }
        // the main tree is always produced, but be total about it
        Ok(match root {
            Some(id) => id,
            None => st.registry.insert(name, None),
        })
    }

    /// The escape gate
    ///
    /// Freezes definitions, escapes `name` if it has not been, and returns a
    /// snapshot of every escaped tree for execution outside the lock.
    pub(crate) fn prepare(&self, name: &str) -> Result<Prepared, TemplateError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if !st.escaped {
            st.escaped = true;
            tracing::debug!(template = %name, "escaping begun, definitions frozen");
        }

        let slot = st
            .registry
            .get(name)
            .ok_or_else(|| TemplateError::Undefined {
                name: name.to_string(),
            })?;
        if !slot.has_body() {
            return Err(TemplateError::Incomplete {
                name: name.to_string(),
            });
        }

        if slot.state.is_unresolved() {
            let mut set = TemplateSet::new(&mut st.registry);
            if let Err(err) = self.escaper.escape(name, &mut set) {
                set.rollback();
                tracing::warn!(template = %name, error = %err, "escaping failed");
                if let Some(slot) = st.registry.get_mut(name) {
                    slot.state = EscapeState::Failed(err.clone());
                }
                return Err(TemplateError::Escape(err));
            }
            if let Some(slot) = st.registry.get_mut(name) {
                if slot.state.is_unresolved() {
                    slot.state = EscapeState::Escaped;
                }
            }
        }

        let slot = st
            .registry
            .get(name)
            .ok_or_else(|| TemplateError::Undefined {
                name: name.to_string(),
            })?;
        if let EscapeState::Failed(err) = &slot.state {
            return Err(TemplateError::Escape(err.clone()));
        }
        let tree = slot.tree.clone().ok_or_else(|| TemplateError::Incomplete {
            name: name.to_string(),
        })?;

        let templates = st
            .registry
            .iter()
            .filter(|s| s.state.is_escaped())
            .filter_map(|s| s.tree.as_ref().map(|t| (s.name.clone(), Arc::clone(t))))
            .collect();

        Ok(Prepared {
            tree,
            templates,
            funcs: Arc::clone(&st.settings.funcs),
            missing_key: st.settings.missing_key,
        })
    }

    /// Independent copy with deep-copied trees, allowed only before any
    /// template has been escaped
    pub(crate) fn deep_clone(&self, name: &str) -> Result<Namespace, TemplateError> {
        let st = self.state.lock();
        if st.registry.iter().any(|s| !s.state.is_unresolved()) {
            return Err(TemplateError::CloneAfterExecution {
                name: name.to_string(),
            });
        }
        let registry = Registry {
            slots: st
                .registry
                .iter()
                .map(|s| Slot {
                    name: s.name.clone(),
                    tree: s.tree.as_ref().map(|t| Arc::new(Tree::clone(t))),
                    state: EscapeState::Unresolved,
                })
                .collect(),
            index: st.registry.index.clone(),
        };
        tracing::debug!(template = %name, templates = registry.slots.len(), "namespace cloned");
        let escaper = self
            .escaper
            .fork()
            .unwrap_or_else(|| Arc::clone(&self.escaper));
        Ok(Self::with_state(
            escaper,
            registry,
            st.settings.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape::{EscapeError, HtmlEscaper};
    use crate::parser::ast::Node;

    fn namespace() -> Namespace {
        Namespace::new(Arc::new(HtmlEscaper))
    }

    #[test]
    fn test_insert_reuses_slot() {
        let mut registry = Registry::default();
        let a = registry.insert("a", None);
        let b = registry.insert("b", None);
        assert_ne!(a, b);
        let again = registry.insert("a", Some(Arc::new(Tree::new("a", vec![]))));
        assert_eq!(a, again);
        assert!(registry.slot(a).tree.is_some());
    }

    #[test]
    fn test_sync_keeps_body_over_empty_tree() {
        let mut registry = Registry::default();
        registry.sync(Tree::new("a", vec![Node::Text("body".to_string())]));
        registry.sync(Tree::new("a", vec![Node::Text("  ".to_string())]));
        assert!(registry.get("a").is_some_and(Slot::has_body));
    }

    #[test]
    fn test_parse_registers_defines() {
        let ns = namespace();
        ns.parse("page", r#"{{define "x"}}X{{end}}P"#).expect("parses");
        ns.with(|st| {
            assert!(st.registry.get("page").is_some_and(Slot::has_body));
            assert!(st.registry.get("x").is_some_and(Slot::has_body));
        });
    }

    #[test]
    fn test_parse_rejects_unknown_function() {
        let ns = namespace();
        let err = ns.parse("page", "{{shout .}}").expect_err("unknown function");
        assert!(matches!(err, TemplateError::Parse { ref errors, .. } if errors.len() == 1));
    }

    #[test]
    fn test_prepare_freezes_definitions() {
        let ns = namespace();
        ns.parse("page", "hi").expect("parses");
        ns.prepare("page").expect("escapes");
        let err = ns.define("other", None).expect_err("frozen");
        assert!(matches!(err, TemplateError::DefinitionAfterExecution { .. }));
    }

    #[test]
    fn test_prepare_failure_still_freezes() {
        let ns = namespace();
        assert!(matches!(
            ns.prepare("ghost"),
            Err(TemplateError::Undefined { .. })
        ));
        assert!(ns.check_can_define("x").is_err());
    }

    #[test]
    fn test_prepare_records_sticky_failure() {
        let ns = namespace();
        ns.parse("page", "<a href=\"{{.}}").expect("parses");
        let first = ns.prepare("page").err().expect("escape fails");
        let second = ns.prepare("page").err().expect("escape fails again");
        match (first, second) {
            (TemplateError::Escape(a), TemplateError::Escape(b)) => assert_eq!(a, b),
            other => panic!("unexpected {other:?}"),
        }
        ns.with(|st| {
            assert!(matches!(
                st.registry.get("page").map(|s| &s.state),
                Some(EscapeState::Failed(EscapeError::EndContext { .. }))
            ));
        });
    }

    #[test]
    fn test_snapshot_holds_only_escaped_trees() {
        let ns = namespace();
        ns.parse("page", r#"{{define "used"}}u{{end}}{{define "unused"}}n{{end}}{{template "used"}}"#)
            .expect("parses");
        let prepared = ns.prepare("page").expect("escapes");
        let mut names: Vec<_> = prepared.templates.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["page", "used"]);
    }

    #[test]
    fn test_clone_refused_after_escape() {
        let ns = namespace();
        ns.parse("page", "hi").expect("parses");
        ns.deep_clone("page").expect("clone before execution");
        ns.prepare("page").expect("escapes");
        assert!(matches!(
            ns.deep_clone("page"),
            Err(TemplateError::CloneAfterExecution { .. })
        ));
    }
}
