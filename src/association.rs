//! Association data model.
//!
//! An `Association` is a named polymorphic slot: records in `table` point at
//! one of several target kinds, selected by `discriminator_field`, with the
//! target's key stored in `id_field`. The set of legal target kinds lives in
//! the association's `TargetMetadata` map and changes at runtime.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Maximum length for association names, field names and target kinds.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Current on-disk configuration format version.
pub const CONFIG_FORMAT_VERSION: u32 = 1;

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("identifier regex is valid"))
}

/// Returns true if `value` is a well-formed identifier.
#[must_use]
pub fn is_valid_identifier(value: &str) -> bool {
    !value.is_empty() && value.len() <= MAX_IDENTIFIER_LEN && identifier_regex().is_match(value)
}

/// Validates an identifier-shaped field (association name, target kind,
/// table or field name).
pub fn validate_identifier(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: field.to_string(),
        });
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::FieldTooLong {
            field: field.to_string(),
            max_length: MAX_IDENTIFIER_LEN,
        });
    }
    if !identifier_regex().is_match(value) {
        return Err(ValidationError::InvalidIdentifier {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}

/// How a target-kind registration was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Produced from naming conventions in already-wired relationships.
    Generated,
    /// Registered by hand.
    Manual,
    /// Observed in live discriminator values.
    Runtime,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Generated => "generated",
            Self::Manual => "manual",
            Self::Runtime => "runtime",
        };
        f.write_str(s)
    }
}

/// One entity kind legally fillable into an association's slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMetadata {
    /// Target-kind identifier; also the discriminator value and the
    /// collection holding target records.
    pub target_kind: String,
    /// Display / model name.
    pub display_name: String,
    /// When the target was first registered.
    pub discovered_at: DateTime<Utc>,
    /// Last time the target was registered, verified or toggled.
    pub last_verified_at: DateTime<Utc>,
    /// Inactive targets are kept for audit and excluded from default queries.
    pub active: bool,
    /// How the registration was established.
    pub provenance: Provenance,
}

impl TargetMetadata {
    /// Creates active target metadata discovered at `now`.
    #[must_use]
    pub fn new(
        target_kind: impl Into<String>,
        display_name: impl Into<String>,
        provenance: Provenance,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            target_kind: target_kind.into(),
            display_name: display_name.into(),
            discovered_at: now,
            last_verified_at: now,
            active: true,
            provenance,
        }
    }
}

/// Parameters for creating an association explicitly.
///
/// Unset field names default to `<name>_type` / `<name>_id`, and the owning
/// table defaults to the association name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationSpec {
    pub(crate) name: String,
    pub(crate) table: Option<String>,
    pub(crate) discriminator_field: Option<String>,
    pub(crate) id_field: Option<String>,
    pub(crate) description: String,
}

impl AssociationSpec {
    /// Starts a spec for association `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            discriminator_field: None,
            id_field: None,
            description: String::new(),
        }
    }

    /// Table holding the owning records.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Discriminator field name (default `<name>_type`).
    #[must_use]
    pub fn discriminator_field(mut self, field: impl Into<String>) -> Self {
        self.discriminator_field = Some(field.into());
        self
    }

    /// Foreign-id field name (default `<name>_id`).
    #[must_use]
    pub fn id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = Some(field.into());
        self
    }

    /// Free-text description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Resolves defaults and validates every identifier.
    pub(crate) fn into_association(self, now: DateTime<Utc>) -> Result<Association, ValidationError> {
        validate_identifier("association", &self.name)?;
        let table = self.table.unwrap_or_else(|| self.name.clone());
        let discriminator_field = self
            .discriminator_field
            .unwrap_or_else(|| format!("{}_type", self.name));
        let id_field = self.id_field.unwrap_or_else(|| format!("{}_id", self.name));
        validate_identifier("table", &table)?;
        validate_identifier("discriminator_field", &discriminator_field)?;
        validate_identifier("id_field", &id_field)?;

        Ok(Association {
            name: self.name,
            table,
            discriminator_field,
            id_field,
            description: self.description,
            targets: BTreeMap::new(),
            created_at: now,
        })
    }
}

/// A named polymorphic relationship.
///
/// Name, table, discriminator and id field are fixed once created; only the
/// description and target set change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Association {
    name: String,
    table: String,
    discriminator_field: String,
    id_field: String,
    /// Human description.
    pub description: String,
    targets: BTreeMap<String, TargetMetadata>,
    created_at: DateTime<Utc>,
}

impl Association {
    /// Association name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table holding the records that own this association.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Field holding the target kind.
    #[must_use]
    pub fn discriminator_field(&self) -> &str {
        &self.discriminator_field
    }

    /// Field holding the target record's id.
    #[must_use]
    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    /// When the association was created.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns metadata for a target kind.
    #[must_use]
    pub fn target(&self, target_kind: &str) -> Option<&TargetMetadata> {
        self.targets.get(target_kind)
    }

    /// All targets ordered by target-kind identifier.
    pub fn targets(&self) -> impl Iterator<Item = &TargetMetadata> {
        self.targets.values()
    }

    /// Target-kind identifiers, optionally including inactive ones.
    #[must_use]
    pub fn target_kinds(&self, include_inactive: bool) -> Vec<String> {
        self.targets
            .values()
            .filter(|t| include_inactive || t.active)
            .map(|t| t.target_kind.clone())
            .collect()
    }

    /// Number of registered targets (active and inactive).
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// True if `other` has the same table, discriminator and id field.
    #[must_use]
    pub fn same_shape(&self, other: &Self) -> bool {
        self.table == other.table
            && self.discriminator_field == other.discriminator_field
            && self.id_field == other.id_field
    }

    pub(crate) fn targets_mut(&mut self) -> &mut BTreeMap<String, TargetMetadata> {
        &mut self.targets
    }
}

/// Aggregate bookkeeping for a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryMetadata {
    /// When the configuration was first created.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Configuration format version.
    pub version: u32,
    /// Number of associations.
    pub total_associations: usize,
    /// Number of targets across all associations, inactive included.
    pub total_targets: usize,
}

/// All associations plus global metadata.
///
/// Owned by the registry; callers only ever see snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfiguration {
    /// Associations by name.
    pub associations: BTreeMap<String, Association>,
    /// Aggregate bookkeeping.
    pub metadata: RegistryMetadata,
}

impl RegistryConfiguration {
    /// Creates an empty configuration stamped at `now`.
    #[must_use]
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            associations: BTreeMap::new(),
            metadata: RegistryMetadata {
                created_at: now,
                updated_at: now,
                version: CONFIG_FORMAT_VERSION,
                total_associations: 0,
                total_targets: 0,
            },
        }
    }

    /// Recomputes aggregate counts and stamps `updated_at`.
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.metadata.total_associations = self.associations.len();
        self.metadata.total_targets = self.associations.values().map(Association::target_count).sum();
        self.metadata.updated_at = now;
    }

    /// True if some association already covers `(table, discriminator_field)`.
    #[must_use]
    pub fn covers(&self, table: &str, discriminator_field: &str) -> bool {
        self.associations
            .values()
            .any(|a| a.table == table && a.discriminator_field == discriminator_field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("target", "jobs").is_ok());
        assert!(validate_identifier("target", "BlogPost").is_ok());
        assert!(validate_identifier("target", "user_profile2").is_ok());
        assert!(matches!(
            validate_identifier("target", ""),
            Err(ValidationError::MissingField { .. })
        ));
        assert!(matches!(
            validate_identifier("target", "2jobs"),
            Err(ValidationError::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            validate_identifier("target", "jobs; drop"),
            Err(ValidationError::InvalidIdentifier { .. })
        ));
        let long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(matches!(
            validate_identifier("target", &long),
            Err(ValidationError::FieldTooLong { .. })
        ));
    }

    #[test]
    fn test_spec_defaults() {
        let now = Utc::now();
        let assoc = AssociationSpec::new("loggable").into_association(now).unwrap();
        assert_eq!(assoc.table(), "loggable");
        assert_eq!(assoc.discriminator_field(), "loggable_type");
        assert_eq!(assoc.id_field(), "loggable_id");
        assert_eq!(assoc.target_count(), 0);
    }

    #[test]
    fn test_spec_rejects_bad_field() {
        let err = AssociationSpec::new("commentable")
            .discriminator_field("commentable type")
            .into_association(Utc::now())
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidIdentifier { .. }));
    }

    #[test]
    fn test_target_kinds_filters_inactive() {
        let now = Utc::now();
        let mut assoc = AssociationSpec::new("commentable").into_association(now).unwrap();
        assoc
            .targets_mut()
            .insert("posts".into(), TargetMetadata::new("posts", "Post", Provenance::Manual, now));
        let mut video = TargetMetadata::new("videos", "Video", Provenance::Runtime, now);
        video.active = false;
        assoc.targets_mut().insert("videos".into(), video);

        assert_eq!(assoc.target_kinds(false), vec!["posts".to_string()]);
        assert_eq!(assoc.target_kinds(true), vec!["posts".to_string(), "videos".to_string()]);
    }

    #[test]
    fn test_configuration_touch_counts() {
        let now = Utc::now();
        let mut config = RegistryConfiguration::empty(now);
        let mut assoc = AssociationSpec::new("taggable").table("tags").into_association(now).unwrap();
        assoc
            .targets_mut()
            .insert("posts".into(), TargetMetadata::new("posts", "Post", Provenance::Manual, now));
        config.associations.insert("taggable".into(), assoc);
        config.touch(now);

        assert_eq!(config.metadata.total_associations, 1);
        assert_eq!(config.metadata.total_targets, 1);
        assert!(config.covers("tags", "taggable_type"));
        assert!(!config.covers("tags", "kind"));
    }

    #[test]
    fn test_provenance_serde() {
        let json = serde_json::to_string(&Provenance::Runtime).unwrap();
        assert_eq!(json, "\"runtime\"");
        assert_eq!(Provenance::Generated.to_string(), "generated");
    }
}
