//! Proposed mutations produced by the recommender.
//!
//! A plan document looks like:
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "items": [
//!     {
//!       "id": "act_0001",
//!       "type": "append_anchored_block",
//!       "target_path": "notes/x.md",
//!       "risk_class": "A",
//!       "payload": { "anchor": "related_v1", "block": "## Related\n<!-- related_v1 -->\n- [[y]]\n" },
//!       "dependencies": [],
//!       "expected_base_digest": "9f86d0…"
//!     }
//!   ]
//! }
//! ```
//!
//! The `type` tag selects the payload shape. Unknown tags are rejected as a
//! schema mismatch; nothing is guessed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Digest, Result, VaultwardError, check_schema};

/// Risk classes gating how an action may be applied and reversed.
///
/// | Class      | Apply                              | Rollback                    |
/// |------------|------------------------------------|-----------------------------|
/// | `A`        | unattended                         | per action                  |
/// | `B1`       | all-or-nothing transaction         | whole transaction only      |
/// | `B2`       | forced override + confirmation     | excluded                    |
/// | `ReadOnly` | preview only                       | n/a                         |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskClass {
    A,
    #[serde(alias = "B")]
    B1,
    B2,
    #[serde(rename = "read-only", alias = "read_only", alias = "ReadOnly")]
    ReadOnly,
}

impl RiskClass {
    /// Ordering used when combining a declared class with a derived one:
    /// the stricter of the two wins. `ReadOnly` never writes, so nothing
    /// outranks it.
    fn severity(self) -> u8 {
        match self {
            Self::A => 0,
            Self::B1 => 1,
            Self::B2 => 2,
            Self::ReadOnly => 3,
        }
    }

    pub fn stricter(self, other: Self) -> Self {
        if other.severity() > self.severity() { other } else { self }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B1 => "B1",
            Self::B2 => "B2",
            Self::ReadOnly => "read-only",
        }
    }
}

impl fmt::Display for RiskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where an anchored block goes inside the target document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Placement {
    #[default]
    End,
    /// Directly below the (unique) heading line `heading`, e.g. `## Related`.
    AfterHeading { heading: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ActionPayload {
    /// Insert `block`, which carries the `<!-- anchor -->` marker line.
    AppendAnchoredBlock {
        anchor: String,
        block: String,
        #[serde(default)]
        placement: Placement,
    },
    /// Add list-valued frontmatter keys that are not present yet.
    MergeFields { fields: BTreeMap<String, Vec<String>> },
    /// Move `source_path` to the action's `target_path` and rewrite wiki
    /// links in `referrers`, each pinned to its planned digest.
    RenameNote {
        source_path: PathBuf,
        #[serde(default)]
        referrers: BTreeMap<PathBuf, Digest>,
    },
    /// Replace the whole document body.
    ReplaceContent { content: String },
    Preview {
        #[serde(default)]
        summary: String,
    },
}

impl ActionPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::AppendAnchoredBlock { .. } => "append_anchored_block",
            Self::MergeFields { .. } => "merge_fields",
            Self::RenameNote { .. } => "rename_note",
            Self::ReplaceContent { .. } => "replace_content",
            Self::Preview { .. } => "preview",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub id: String,
    pub target_path: PathBuf,
    pub risk_class: RiskClass,
    #[serde(flatten)]
    pub payload: ActionPayload,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Digest of the target as the recommender saw it. `None` means the
    /// target is expected not to exist.
    #[serde(default)]
    pub expected_base_digest: Option<Digest>,
}

impl ProposedAction {
    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }

    /// The file whose digest `expected_base_digest` pins. For renames that is
    /// the source note; for everything else the target.
    pub fn base_path(&self) -> &PathBuf {
        match &self.payload {
            ActionPayload::RenameNote { source_path, .. } => source_path,
            _ => &self.target_path,
        }
    }
}

/// The marker line that identifies an anchored block.
pub fn anchor_marker(anchor: &str) -> String {
    format!("<!-- {anchor} -->")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub schema_version: u32,
    #[serde(default)]
    pub items: Vec<ProposedAction>,
}

impl ActionPlan {
    pub fn new(items: Vec<ProposedAction>) -> Self {
        Self {
            schema_version: crate::SCHEMA_VERSION,
            items,
        }
    }

    /// Parse a plan document, checking the schema version before the items so
    /// a future layout is reported as such rather than as a field error.
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let version = value
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| VaultwardError::SchemaMismatch {
                record: "action-plan",
                found: "missing".to_string(),
            })?;
        check_schema("action-plan", u32::try_from(version).unwrap_or(u32::MAX))?;
        serde_json::from_value(value).map_err(|err| VaultwardError::SchemaMismatch {
            record: "action",
            found: err.to_string(),
        })
    }
}
