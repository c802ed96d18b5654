//! Credentials scraped from the platform's compose file
//!
//! The database containers are initialised from environment assignments in
//! `docker-compose.yml`; the dump and restore commands need the same values.
//! Both list (`- KEY=value`) and mapping (`KEY: value`) forms are accepted.
//! A missing or empty assignment is an error, never an empty credential.

use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::error::{AgentError, Result};
use crate::utils::mask_sensitive;

#[derive(Debug, Clone)]
pub struct ComposeFile {
    path: PathBuf,
}

impl ComposeFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value assigned to `var`; the last assignment wins
    pub async fn credential(&self, var: &str) -> Result<String> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::NotFound(format!("compose file {}", self.path.display()))
            } else {
                AgentError::io(format!("read {}", self.path.display()), e)
            }
        })?;

        let value = find_assignment(&contents, var)?.ok_or_else(|| {
            AgentError::NotFound(format!("{} in {}", var, self.path.display()))
        })?;
        debug!(var, value = %mask_sensitive(&value, 2), "credential read from compose file");
        Ok(value)
    }
}

/// Scan compose text for an environment assignment of `var`
pub fn find_assignment(contents: &str, var: &str) -> Result<Option<String>> {
    let var = regex::escape(var);
    let pattern = format!(
        r#"^\s*(?:-\s*["']?{var}\s*=(?P<list>[^\r\n]*?)["']?|{var}\s*:(?P<map>[^\r\n]*))\s*$"#
    );
    let re = Regex::new(&format!("(?m){}", pattern))
        .map_err(|e| AgentError::Config(format!("credential pattern: {}", e)))?;

    let value = re
        .captures_iter(contents)
        .filter_map(|caps| caps.name("list").or_else(|| caps.name("map")))
        .map(|m| unquote(m.as_str().trim()))
        .last()
        .filter(|value| !value.is_empty());

    Ok(value)
}

fn unquote(value: &str) -> String {
    let quoted = value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')));
    if quoted {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}
