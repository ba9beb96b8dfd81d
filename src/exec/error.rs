use thiserror::Error;

/// Failure while running a tree against data
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("template {template:?}: map has no entry for key {key:?}")]
    MissingKey { template: String, key: String },

    #[error("template {template:?}: can't evaluate field {field:?} in type {kind}")]
    NotAnObject {
        template: String,
        field: String,
        kind: &'static str,
    },

    #[error("template {template:?}: can't give argument to non-function {operand}")]
    NotAFunction { template: String, operand: String },

    #[error("template {template:?}: function {name:?} not defined")]
    UndefinedFunction { template: String, name: String },

    #[error("template {template:?}: error calling {name}: {message}")]
    Func {
        template: String,
        name: String,
        message: String,
    },

    #[error("template {template:?}: no such template {name:?}")]
    UndefinedTemplate { template: String, name: String },

    #[error("template {template:?}: exceeded maximum template depth ({depth})")]
    Depth { template: String, depth: usize },

    #[error("template {template:?}: range can't iterate over {kind}")]
    Range { template: String, kind: &'static str },

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}
