//! Registry health checks.
//!
//! Structural problems are collected into a report instead of failing on the
//! first one, so a health check shows everything that is wrong at once.

use serde::{Deserialize, Serialize};

use crate::association::{is_valid_identifier, Association, RegistryConfiguration, TargetMetadata};

/// One finding of a registry validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Association the finding concerns.
    pub association: String,
    /// Target kind, for target-level findings.
    pub target_kind: Option<String>,
    /// What is wrong.
    pub message: String,
}

impl ValidationIssue {
    fn association(association: &str, message: impl Into<String>) -> Self {
        Self {
            association: association.to_string(),
            target_kind: None,
            message: message.into(),
        }
    }

    fn target(association: &str, target_kind: &str, message: impl Into<String>) -> Self {
        Self {
            association: association.to_string(),
            target_kind: Some(target_kind.to_string()),
            message: message.into(),
        }
    }
}

/// Result of `AssociationRegistry::validate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Hard structural errors.
    pub errors: Vec<ValidationIssue>,
    /// Suspicious but legal states (no targets, inactive targets).
    pub warnings: Vec<ValidationIssue>,
    /// Associations inspected.
    pub associations_checked: usize,
    /// Targets inspected.
    pub targets_checked: usize,
}

impl ValidationReport {
    /// True when no hard errors were found.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

fn check_association(assoc: &Association, report: &mut ValidationReport) {
    let name = assoc.name();
    for (field, value) in [
        ("association name", name),
        ("table", assoc.table()),
        ("discriminator field", assoc.discriminator_field()),
        ("id field", assoc.id_field()),
    ] {
        if !is_valid_identifier(value) {
            report
                .errors
                .push(ValidationIssue::association(name, format!("malformed {field}: {value:?}")));
        }
    }
    if assoc.discriminator_field() == assoc.id_field() {
        report.errors.push(ValidationIssue::association(
            name,
            "discriminator and id field must differ",
        ));
    }
}

fn check_target(assoc: &str, key: &str, target: &TargetMetadata, report: &mut ValidationReport) {
    if key != target.target_kind {
        report.errors.push(ValidationIssue::target(
            assoc,
            key,
            format!("registered under {key:?} but names itself {:?}", target.target_kind),
        ));
    }
    if !is_valid_identifier(&target.target_kind) {
        report
            .errors
            .push(ValidationIssue::target(assoc, key, "malformed target-kind identifier"));
    }
    if target.display_name.trim().is_empty() {
        report
            .errors
            .push(ValidationIssue::target(assoc, key, "missing display name"));
    }
    if target.last_verified_at < target.discovered_at {
        report
            .errors
            .push(ValidationIssue::target(assoc, key, "verified before it was discovered"));
    }
    if !target.active {
        report
            .warnings
            .push(ValidationIssue::target(assoc, key, "target is inactive"));
    }
}

/// Walks every association and target of `config`.
///
/// Inactive targets are only inspected when `include_inactive` is set.
#[must_use]
pub fn validate_configuration(config: &RegistryConfiguration, include_inactive: bool) -> ValidationReport {
    let mut report = ValidationReport::default();

    for (key, assoc) in &config.associations {
        report.associations_checked += 1;
        if key != assoc.name() {
            report.errors.push(ValidationIssue::association(
                key,
                format!("registered under {key:?} but names itself {:?}", assoc.name()),
            ));
        }
        check_association(assoc, &mut report);

        let mut considered = 0usize;
        for target in assoc.targets().filter(|t| include_inactive || t.active) {
            considered += 1;
            report.targets_checked += 1;
            check_target(assoc.name(), &target.target_kind, target, &mut report);
        }

        if considered == 0 {
            let msg = if include_inactive {
                "association has no targets"
            } else {
                "association has no active targets"
            };
            report.warnings.push(ValidationIssue::association(assoc.name(), msg));
        }
    }

    report
}
