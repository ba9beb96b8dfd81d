use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::error::ParseError;
use crate::escape::EscapeError;
use crate::exec::ExecError;

/// Errors from defining, cloning or executing templates
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Definition attempted after a template in the namespace executed
    #[error("cannot define template {name:?}: its namespace has already executed")]
    DefinitionAfterExecution { name: String },

    #[error("no such template {name:?}")]
    Undefined { name: String },

    /// Registered name with no body
    #[error("template {name:?} is incomplete or empty")]
    Incomplete { name: String },

    /// Sticky failure from the escaper, replayed on every execution
    #[error(transparent)]
    Escape(#[from] EscapeError),

    #[error("cannot clone {name:?} after it has executed")]
    CloneAfterExecution { name: String },

    #[error("template {name:?}: {}", join_errors(.errors))]
    Parse {
        name: String,
        text: String,
        errors: Vec<ParseError>,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("cannot convert template data: {0}")]
    Data(#[from] serde_json::Error),

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unrecognized option {0:?}")]
    UnknownOption(String),

    #[error("no files named")]
    NoFiles,

    #[error("invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("pattern matches no files: {pattern:?}")]
    NoMatches { pattern: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl TemplateError {
    /// Parse errors rendered against their source text
    ///
    /// Returns `None` for every other kind of error.
    pub fn report(&self) -> Option<String> {
        match self {
            TemplateError::Parse { name, text, errors } => Some(
                errors
                    .iter()
                    .map(|e| e.format(text, name))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        }
    }
}

fn join_errors(errors: &[ParseError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
