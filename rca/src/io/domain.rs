//! Domain context: rules, telemetry schema and candidate taxonomy.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::core::answer::Taxonomy;

pub const RULES_FILE: &str = "rules.md";
pub const SCHEMA_FILE: &str = "schema.md";
pub const CANDIDATES_FILE: &str = "candidates.md";

/// Immutable domain knowledge injected into every prompt of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainContext {
    pub rules: String,
    pub schema: String,
    pub candidates: String,
    taxonomy: Taxonomy,
}

impl DomainContext {
    pub fn new(
        rules: impl Into<String>,
        schema: impl Into<String>,
        candidates: impl Into<String>,
    ) -> Self {
        let candidates = candidates.into();
        let taxonomy = Taxonomy::parse(&candidates);
        Self {
            rules: rules.into(),
            schema: schema.into(),
            candidates,
            taxonomy,
        }
    }

    /// Load `rules.md`, `schema.md` and `candidates.md` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let rules = read_required(&dir.join(RULES_FILE))?;
        let schema = read_required(&dir.join(SCHEMA_FILE))?;
        let candidates = read_required(&dir.join(CANDIDATES_FILE))?;
        let domain = Self::new(rules, schema, candidates);
        if domain.taxonomy.components().next().is_none() {
            bail!(
                "{} lists no candidate components",
                dir.join(CANDIDATES_FILE).display()
            );
        }
        debug!(
            dir = %dir.display(),
            components = domain.taxonomy.components().count(),
            "loaded domain context"
        );
        Ok(domain)
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }
}

fn read_required(path: &Path) -> Result<String> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read domain file {}", path.display()))?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        bail!("domain file {} is empty", path.display());
    }
    Ok(trimmed.to_string())
}
