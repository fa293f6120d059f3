//! Writing accepted discoveries into the registry.

use serde::Serialize;
use tracing::{info, warn};

use crate::association::{validate_identifier, AssociationSpec, TargetMetadata};
use crate::discovery::{DiscoveryResult, ProposedAssociation};
use crate::error::AssocResult;
use crate::registry::AssociationRegistry;

/// Field-analysis results at or above this confidence are applied when
/// `auto_apply` is set.
pub const AUTO_APPLY_CONFIDENCE: f64 = 0.7;

/// A discovery that could not be applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyFailure {
    /// The rejected result.
    pub result: DiscoveryResult,
    /// Why it was rejected.
    pub reason: String,
}

/// Outcome of applying a batch of discoveries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    /// Registrations written (new or refreshed).
    pub applied: Vec<TargetMetadata>,
    /// Valid but not approved; left for the caller to decide.
    pub pending: Vec<DiscoveryResult>,
    /// Results that failed validation or registration.
    pub failures: Vec<ApplyFailure>,
}

impl ApplyReport {
    pub(crate) fn merge(&mut self, other: Self) {
        self.applied.extend(other.applied);
        self.pending.extend(other.pending);
        self.failures.extend(other.failures);
    }
}

fn approved_by_default(result: &DiscoveryResult, auto_apply: bool) -> bool {
    result.pre_validated || (auto_apply && result.confidence >= AUTO_APPLY_CONFIDENCE)
}

pub(crate) fn apply_results(
    registry: &AssociationRegistry,
    results: &[DiscoveryResult],
    approve: impl Fn(&DiscoveryResult) -> bool,
) -> ApplyReport {
    let mut report = ApplyReport::default();

    for result in results {
        let checked = validate_identifier("association", &result.association)
            .and_then(|()| validate_identifier("target_kind", &result.target_kind));
        if let Err(e) = checked {
            warn!(
                association = %result.association,
                target_kind = %result.target_kind,
                error = %e,
                "discovered target failed validation"
            );
            report.failures.push(ApplyFailure {
                result: result.clone(),
                reason: e.to_string(),
            });
            continue;
        }

        if !approve(result) {
            report.pending.push(result.clone());
            continue;
        }

        match registry.add_target(
            &result.association,
            &result.target_kind,
            &result.display_name,
            result.source.provenance(),
        ) {
            Ok(meta) => report.applied.push(meta),
            Err(e) => {
                warn!(
                    association = %result.association,
                    target_kind = %result.target_kind,
                    error = %e,
                    "failed to apply discovered target"
                );
                report.failures.push(ApplyFailure {
                    result: result.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    if !report.applied.is_empty() {
        info!(
            applied = report.applied.len(),
            pending = report.pending.len(),
            failed = report.failures.len(),
            "applied discoveries"
        );
    }
    report
}

/// Applies results approved by provenance or, with `auto_apply`, by confidence.
pub(crate) fn apply_discoveries(
    registry: &AssociationRegistry,
    results: &[DiscoveryResult],
    auto_apply: bool,
) -> ApplyReport {
    apply_results(registry, results, |r| approved_by_default(r, auto_apply))
}

/// Registers a proposed association and all of its valid targets.
pub(crate) fn apply_proposal(registry: &AssociationRegistry, proposal: &ProposedAssociation) -> AssocResult<ApplyReport> {
    registry.register_association(
        AssociationSpec::new(&proposal.name)
            .table(&proposal.table)
            .discriminator_field(&proposal.discriminator_field)
            .id_field(&proposal.id_field)
            .description(format!(
                "Discovered from {}.{} (confidence {:.2})",
                proposal.table, proposal.discriminator_field, proposal.confidence
            )),
    )?;
    Ok(apply_results(registry, &proposal.targets, |_| true))
}
