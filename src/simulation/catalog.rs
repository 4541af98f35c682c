//! # Catalog — influencing techniques and negotiation tactics
//!
//! ## Responsibility
//! Hold the read-only list of techniques and tactics a queue may reference,
//! loaded from a TOML file at startup.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same catalog
//! - IDs are unique within each list (checked by [`Catalog::from_toml`])
//!
//! ## NOT Responsible For
//! - Importing catalog data from CSV/JSON
//! - Editing the catalog at runtime

use super::SimulationError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// A psychological influencing technique (e.g. reciprocity, anchoring).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Technique {
    /// Unique ID referenced by scenarios and runs.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Description passed to the runner.
    #[serde(default)]
    pub description: String,
    /// Optional grouping label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// A strategic negotiation tactic (e.g. good cop/bad cop, nibbling).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tactic {
    /// Unique ID referenced by scenarios and runs.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Description passed to the runner.
    #[serde(default)]
    pub description: String,
    /// Optional grouping label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Techniques and tactics available to simulations.
///
/// # Format
///
/// ```toml
/// [[techniques]]
/// id = "reciprocity"
/// name = "Reciprocity"
/// description = "Offer a small concession to trigger one in return."
///
/// [[tactics]]
/// id = "anchoring"
/// name = "Anchoring"
/// description = "Open with an ambitious first offer."
/// ```
///
/// # Panics
///
/// No methods on this type panic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// Available techniques.
    #[serde(default)]
    pub techniques: Vec<Technique>,
    /// Available tactics.
    #[serde(default)]
    pub tactics: Vec<Tactic>,
}

impl Catalog {
    /// Parse a catalog from a TOML string.
    ///
    /// # Errors
    ///
    /// [`SimulationError::Validation`] on invalid TOML or duplicate IDs.
    pub fn from_toml(content: &str) -> Result<Self, SimulationError> {
        let catalog: Self = toml::from_str(content)
            .map_err(|e| SimulationError::Validation(format!("catalog parse error: {e}")))?;
        catalog.check_unique()?;
        Ok(catalog)
    }

    /// Read and parse a catalog file.
    ///
    /// # Errors
    ///
    /// [`SimulationError::Validation`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, SimulationError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SimulationError::Validation(format!("cannot read catalog {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Look up a technique by ID.
    pub fn technique(&self, id: &str) -> Option<&Technique> {
        self.techniques.iter().find(|t| t.id == id)
    }

    /// Look up a tactic by ID.
    pub fn tactic(&self, id: &str) -> Option<&Tactic> {
        self.tactics.iter().find(|t| t.id == id)
    }

    /// Check that every technique and tactic ID exists.
    ///
    /// # Errors
    ///
    /// [`SimulationError::Validation`] listing every unknown ID.
    pub fn ensure_known(
        &self,
        technique_ids: &[String],
        tactic_ids: &[String],
    ) -> Result<(), SimulationError> {
        let mut unknown = Vec::new();
        for id in technique_ids {
            if self.technique(id).is_none() {
                unknown.push(format!("technique '{id}'"));
            }
        }
        for id in tactic_ids {
            if self.tactic(id).is_none() {
                unknown.push(format!("tactic '{id}'"));
            }
        }
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(SimulationError::Validation(format!(
                "unknown {}",
                unknown.join(", ")
            )))
        }
    }

    fn check_unique(&self) -> Result<(), SimulationError> {
        let mut seen = HashSet::new();
        for t in &self.techniques {
            if !seen.insert(t.id.as_str()) {
                return Err(SimulationError::Validation(format!(
                    "duplicate technique id '{}'",
                    t.id
                )));
            }
        }
        seen.clear();
        for t in &self.tactics {
            if !seen.insert(t.id.as_str()) {
                return Err(SimulationError::Validation(format!(
                    "duplicate tactic id '{}'",
                    t.id
                )));
            }
        }
        Ok(())
    }
}
