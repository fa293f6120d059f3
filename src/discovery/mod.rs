//! Target-kind discovery.
//!
//! Two strategies propose target kinds without a hand-written list:
//! - **naming patterns**: relationship names such as `commentableVideo`
//!   are matched against each association's name;
//! - **field analysis**: the distinct values of a discriminator field are
//!   scored for how much they look like a polymorphic type column.
//!
//! Discovery is advisory. It never touches the registry except through the
//! `apply_*` methods, and a failed scan of one (table, field) pair is logged
//! and reported, never fatal to the rest of the scan.

mod apply;
mod naming;
mod statistical;
mod worker;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::association::{Provenance, RegistryConfiguration};
use crate::error::{AssocError, AssocResult, DiscoveryError, ExecutionError};
use crate::registry::AssociationRegistry;
use crate::storage::DataSource;

pub use apply::{ApplyFailure, ApplyReport, AUTO_APPLY_CONFIDENCE};
pub use naming::NAMING_CONFIDENCE;
pub use statistical::{
    analyze_field, field_prefix, infer_id_field, is_type_like_field, ConfidenceWeights, FieldAnalysis, Indicators,
    StatisticalConfig,
};
pub use worker::{DiscoveryRun, DiscoveryWorker, DiscoveryWorkerConfig};

/// Which strategy produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    /// Matched a relationship name.
    NamingPattern,
    /// Observed in a discriminator column.
    FieldAnalysis,
}

impl DiscoverySource {
    /// Provenance recorded when the result is applied.
    #[must_use]
    pub const fn provenance(self) -> Provenance {
        match self {
            Self::NamingPattern => Provenance::Generated,
            Self::FieldAnalysis => Provenance::Runtime,
        }
    }
}

/// A proposed (association, target kind) pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    /// Association the target belongs to.
    pub association: String,
    /// Proposed target-kind identifier.
    pub target_kind: String,
    /// Proposed display name.
    pub display_name: String,
    /// Heuristic confidence in [0, 1].
    pub confidence: f64,
    /// Strategy that produced the result.
    pub source: DiscoverySource,
    /// Applied without `auto_apply` (naming-pattern matches).
    pub pre_validated: bool,
    /// Records carrying this discriminator value, for field analysis.
    pub record_count: Option<u64>,
}

/// A discriminator column not yet covered by any association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAssociation {
    /// Proposed association name.
    pub name: String,
    /// Table holding the discriminator column.
    pub table: String,
    /// The discriminator column.
    pub discriminator_field: String,
    /// Inferred foreign-id column.
    pub id_field: String,
    /// Confidence of the column analysis.
    pub confidence: f64,
    /// The analysis behind the proposal.
    pub analysis: FieldAnalysis,
    /// Targets found in the column, most frequent first.
    pub targets: Vec<DiscoveryResult>,
}

/// Findings plus the candidates that could not be analysed.
#[derive(Debug, Clone)]
pub struct DiscoveryReport<T> {
    /// What was found.
    pub found: Vec<T>,
    /// Candidates that could not be analysed.
    pub errors: Vec<DiscoveryError>,
}

impl<T> Default for DiscoveryReport<T> {
    fn default() -> Self {
        Self {
            found: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DiscoveryReport<T> {
    /// True if no candidate failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

fn sort_by_confidence(results: &mut [DiscoveryResult]) {
    results.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| b.record_count.cmp(&a.record_count))
            .then_with(|| a.target_kind.cmp(&b.target_kind))
    });
}

/// Runs discovery against a registry and a data source.
pub struct DiscoveryEngine {
    registry: Arc<AssociationRegistry>,
    source: Arc<dyn DataSource>,
    config: StatisticalConfig,
}

impl std::fmt::Debug for DiscoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DiscoveryEngine {
    /// Creates an engine with the default statistical configuration.
    #[must_use]
    pub fn new(registry: Arc<AssociationRegistry>, source: Arc<dyn DataSource>) -> Self {
        Self::with_config(registry, source, StatisticalConfig::default())
    }

    /// Creates an engine with an explicit statistical configuration.
    #[must_use]
    pub fn with_config(registry: Arc<AssociationRegistry>, source: Arc<dyn DataSource>, config: StatisticalConfig) -> Self {
        Self {
            registry,
            source,
            config,
        }
    }

    /// The statistical configuration.
    #[must_use]
    pub const fn config(&self) -> &StatisticalConfig {
        &self.config
    }

    /// The registry results are applied to.
    #[must_use]
    pub const fn registry(&self) -> &Arc<AssociationRegistry> {
        &self.registry
    }

    /// Naming-pattern discovery across every registered association.
    pub fn discover_from_names<S: AsRef<str>>(&self, relationship_names: &[S]) -> Vec<DiscoveryResult> {
        let mut results = Vec::new();
        for name in self.registry.associations() {
            if let Some(assoc) = self.registry.association(&name) {
                results.extend(naming::discover(&assoc, relationship_names));
            }
        }
        debug!(found = results.len(), "naming-pattern discovery finished");
        results
    }

    /// Scores one (table, field) pair from its live value distribution.
    ///
    /// # Errors
    ///
    /// Returns a `DiscoveryError` if the data source cannot list the values.
    pub fn analyze(&self, table: &str, field: &str) -> Result<FieldAnalysis, DiscoveryError> {
        let values = self
            .source
            .list_distinct_values(table, field)
            .map_err(|e| DiscoveryError::new(table, field, e.to_string()))?;
        Ok(analyze_field(table, field, values, &self.config))
    }

    /// Field-analysis discovery of unregistered target kinds for one
    /// association, using its own table and discriminator field.
    ///
    /// A discriminator scoring below `min_confidence` yields no results.
    ///
    /// # Errors
    ///
    /// `UnknownAssociation` if the association is not registered. Scan
    /// failures are reported in the returned report instead.
    pub fn discover_targets(&self, association: &str) -> AssocResult<DiscoveryReport<DiscoveryResult>> {
        let assoc = self
            .registry
            .association(association)
            .ok_or_else(|| AssocError::unknown_association(association))?;

        let mut report = DiscoveryReport::default();
        let analysis = match self.analyze(assoc.table(), assoc.discriminator_field()) {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "discriminator scan failed");
                report.errors.push(e);
                return Ok(report);
            }
        };
        if analysis.confidence < self.config.min_confidence {
            debug!(
                association,
                confidence = analysis.confidence,
                "discriminator below confidence threshold"
            );
            return Ok(report);
        }

        report.found = targets_from_analysis(association, &analysis)
            .into_iter()
            .filter(|r| assoc.target(&r.target_kind).is_none())
            .collect();
        sort_by_confidence(&mut report.found);
        Ok(report)
    }

    /// Scans every table and field for discriminator columns not already
    /// covered by `current`.
    ///
    /// Candidates below `min_confidence`, and candidates with no inferable
    /// id field, are dropped. Proposals come back most confident first.
    ///
    /// # Errors
    ///
    /// Only if the table list itself cannot be read. Per-table and per-field
    /// failures are reported in the returned report.
    pub fn detect_new_associations(
        &self,
        current: &RegistryConfiguration,
    ) -> AssocResult<DiscoveryReport<ProposedAssociation>> {
        let tables = self.source.list_tables().map_err(ExecutionError::from)?;
        let mut report = DiscoveryReport::default();

        for table in tables {
            let fields = match self.source.list_fields(&table) {
                Ok(fields) => fields,
                Err(e) => {
                    let err = DiscoveryError::new(&table, "*", e.to_string());
                    warn!(error = %err, "field listing failed; skipping table");
                    report.errors.push(err);
                    continue;
                }
            };

            for field in &fields {
                if current.covers(&table, field) {
                    continue;
                }
                let analysis = match self.analyze(&table, field) {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(error = %e, "field scan failed; continuing");
                        report.errors.push(e);
                        continue;
                    }
                };
                if analysis.confidence < self.config.min_confidence {
                    continue;
                }
                let Some(id_field) = infer_id_field(field, &fields) else {
                    debug!(table = %table, field = %field, "no id field for candidate");
                    continue;
                };

                let name = field_prefix(field).unwrap_or(field).to_string();
                let mut targets = targets_from_analysis(&name, &analysis);
                sort_by_confidence(&mut targets);
                debug!(table = %table, field = %field, confidence = analysis.confidence, "association candidate");
                report.found.push(ProposedAssociation {
                    name,
                    table: table.clone(),
                    discriminator_field: field.clone(),
                    id_field,
                    confidence: analysis.confidence,
                    analysis,
                    targets,
                });
            }
        }

        report.found.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.table.cmp(&b.table))
                .then_with(|| a.discriminator_field.cmp(&b.discriminator_field))
        });
        info!(
            proposals = report.found.len(),
            errors = report.errors.len(),
            "association detection finished"
        );
        Ok(report)
    }

    /// Writes approved results into the registry.
    ///
    /// Each result is re-validated first; invalid ones land in `failures`.
    /// Valid results are applied if pre-validated, or if `auto_apply` is set
    /// and their confidence reaches `AUTO_APPLY_CONFIDENCE`. Everything else
    /// is returned as `pending`.
    pub fn apply_discoveries(&self, results: &[DiscoveryResult], auto_apply: bool) -> ApplyReport {
        apply::apply_discoveries(&self.registry, results, auto_apply)
    }

    /// Registers a proposed association with its valid targets.
    ///
    /// # Errors
    ///
    /// Fails if the association cannot be registered, e.g. the name is taken
    /// by an association with different fields.
    pub fn apply_proposal(&self, proposal: &ProposedAssociation) -> AssocResult<ApplyReport> {
        apply::apply_proposal(&self.registry, proposal)
    }

    /// One full pass: naming discovery, field analysis of every registered
    /// association, then apply.
    pub fn run_once<S: AsRef<str>>(&self, relationship_names: &[S], auto_apply: bool) -> DiscoveryRun {
        let mut results = self.discover_from_names(relationship_names);
        let mut errors = Vec::new();

        for association in self.registry.associations() {
            match self.discover_targets(&association) {
                Ok(report) => {
                    errors.extend(report.errors);
                    for found in report.found {
                        let duplicate = results
                            .iter()
                            .any(|r| r.association == found.association && r.target_kind == found.target_kind);
                        if !duplicate {
                            results.push(found);
                        }
                    }
                }
                // Removed concurrently; nothing to discover.
                Err(e) if e.is_unknown_association() => {}
                Err(e) => errors.push(DiscoveryError::new(&association, "*", e.to_string())),
            }
        }
        sort_by_confidence(&mut results);

        let applied = self.apply_discoveries(&results, auto_apply);
        DiscoveryRun {
            results,
            errors,
            applied,
        }
    }
}

fn targets_from_analysis(association: &str, analysis: &FieldAnalysis) -> Vec<DiscoveryResult> {
    analysis
        .values
        .iter()
        .map(|(value, count)| {
            let target_kind = value.as_str().map_or_else(|| value.to_string(), str::to_string);
            DiscoveryResult {
                association: association.to_string(),
                display_name: naming::display_name(&target_kind),
                target_kind,
                confidence: analysis.confidence,
                source: DiscoverySource::FieldAnalysis,
                pre_validated: false,
                record_count: Some(*count),
            }
        })
        .collect()
}
