//! Loading templates from files

use std::path::{Path, PathBuf};

use super::{Template, TemplateError};
use crate::config::EngineConfig;

/// Base name of a path, used as the template name
fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Parse files into a new namespace named after the first file
pub fn parse_files<P: AsRef<Path>>(paths: &[P]) -> Result<Template, TemplateError> {
    parse_files_with(&EngineConfig::default(), paths)
}

/// Like [`parse_files`], with `config` applied before any file is parsed
pub fn parse_files_with<P: AsRef<Path>>(
    config: &EngineConfig,
    paths: &[P],
) -> Result<Template, TemplateError> {
    let first = paths.first().ok_or(TemplateError::NoFiles)?;
    let root = Template::new(&base_name(first.as_ref()));
    root.apply_config(config);
    root.parse_files(paths)
}

/// Parse every file matching `pattern` into a new namespace
pub fn parse_glob(pattern: &str) -> Result<Template, TemplateError> {
    let paths = glob_paths(pattern)?;
    parse_files(&paths)
}

fn glob_paths(pattern: &str) -> Result<Vec<PathBuf>, TemplateError> {
    let mut paths = Vec::new();
    for entry in glob::glob(pattern)? {
        let path = entry.map_err(|e| TemplateError::Io {
            path: e.path().to_path_buf(),
            source: e.into(),
        })?;
        paths.push(path);
    }
    if paths.is_empty() {
        return Err(TemplateError::NoMatches {
            pattern: pattern.to_string(),
        });
    }
    Ok(paths)
}

impl Template {
    /// Parse each file as a template named by its base name
    ///
    /// A file whose base name matches this template becomes its body; any
    /// other file defines a sibling. A later file with the same base name
    /// replaces an earlier one.
    pub fn parse_files<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Template, TemplateError> {
        self.check_can_define()?;
        if paths.is_empty() {
            return Err(TemplateError::NoFiles);
        }
        for path in paths {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let name = base_name(path);
            let target = if name == self.name() {
                self.clone()
            } else {
                self.new_template(&name)?
            };
            target.parse(&text)?;
            tracing::debug!(template = %name, path = %path.display(), "parsed template file");
        }
        Ok(self.clone())
    }

    /// Parse every file matching `pattern`, as [`Template::parse_files`]
    pub fn parse_glob(&self, pattern: &str) -> Result<Template, TemplateError> {
        self.check_can_define()?;
        let paths = glob_paths(pattern)?;
        self.parse_files(&paths)
    }
}
