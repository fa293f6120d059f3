//! Association registry.
//!
//! The registry is the single authoritative, in-memory view of every
//! association and its legal target kinds. Reads take a shared lock and see a
//! consistent snapshot; mutations take the write lock, so they are
//! linearizable within one instance. After each mutation the registry:
//! 1. recomputes aggregate counts and stamps `updated_at`;
//! 2. saves the new snapshot through the `ConfigStore`, if one is attached
//!    (still under the write lock, so saves land in mutation order);
//! 3. releases the lock and notifies listeners with `RegistryChanged`.
//!
//! A failed save is reported to the caller as `PersistenceError`, but the
//! in-memory change stays applied and its event is still emitted.

mod validation;

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::association::{
    validate_identifier, Association, AssociationSpec, Provenance, RegistryConfiguration, TargetMetadata,
};
use crate::error::{AssocError, AssocResult, ValidationError};
use crate::events::{ChangeKind, ChangeListener, ListenerId, RegistryChanged};
use crate::storage::{ConfigStore, PersistenceError};
use crate::time::{Clock, SystemClock};

pub use validation::{validate_configuration, ValidationIssue, ValidationReport};

fn lock_err(context: &'static str) -> AssocError {
    AssocError::internal(format!("poisoned lock: {context}"))
}

/// What a mutation did to the configuration.
enum Outcome<T> {
    /// Nothing changed: no save, no event.
    Unchanged(T),
    /// Configuration changed; the event (if any) is emitted after saving.
    Changed(T, Option<RegistryChanged>),
}

/// Authoritative registry of associations and their target kinds.
pub struct AssociationRegistry {
    state: RwLock<RegistryConfiguration>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ChangeListener>)>>,
    store: Option<Arc<dyn ConfigStore>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AssociationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssociationRegistry")
            .field("has_store", &self.store.is_some())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl Default for AssociationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AssociationRegistry {
    /// Creates an empty, unpersisted registry on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty, unpersisted registry on `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let config = RegistryConfiguration::empty(clock.now());
        Self::from_configuration(config, clock)
    }

    /// Wraps an existing configuration without persistence.
    #[must_use]
    pub fn from_configuration(config: RegistryConfiguration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(config),
            listeners: RwLock::new(Vec::new()),
            store: None,
            clock,
        }
    }

    /// Loads the configuration from `store` (empty if nothing was stored) and
    /// persists every subsequent mutation back to it.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError` if the store fails to load.
    pub fn open(store: Arc<dyn ConfigStore>, clock: Arc<dyn Clock>) -> AssocResult<Self> {
        let config = match store.load()? {
            Some(mut config) => {
                config.touch(config.metadata.updated_at);
                config
            }
            None => RegistryConfiguration::empty(clock.now()),
        };
        debug!(
            associations = config.metadata.total_associations,
            targets = config.metadata.total_targets,
            "registry opened"
        );
        Ok(Self {
            state: RwLock::new(config),
            listeners: RwLock::new(Vec::new()),
            store: Some(store),
            clock,
        })
    }

    /// The registry's clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Registers a change listener.
    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        let id = ListenerId::new();
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push((id, listener)),
            Err(poisoned) => poisoned.into_inner().push((id, listener)),
        }
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = match self.listeners.write() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn emit(&self, event: &RegistryChanged) {
        let listeners: Vec<Arc<dyn ChangeListener>> = match self.listeners.read() {
            Ok(l) => l.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|(_, l)| Arc::clone(l)).collect(),
        };
        for listener in listeners {
            listener.on_registry_changed(event);
        }
    }

    /// Runs a mutation under the write lock, then persists and notifies.
    fn mutate<T>(
        &self,
        context: &'static str,
        f: impl FnOnce(&mut RegistryConfiguration, DateTime<Utc>) -> AssocResult<Outcome<T>>,
    ) -> AssocResult<T> {
        let now = self.clock.now();
        let (out, event, saved) = {
            let mut state = self.state.write().map_err(|_| lock_err(context))?;
            let (out, event) = match f(&mut state, now)? {
                Outcome::Unchanged(out) => return Ok(out),
                Outcome::Changed(out, event) => (out, event),
            };
            state.touch(now);
            let saved: Result<(), PersistenceError> = match &self.store {
                Some(store) => store.save(&state),
                None => Ok(()),
            };
            (out, event, saved)
        };

        if let Some(event) = &event {
            debug!(
                association = %event.association,
                target_kind = %event.target_kind,
                kind = ?event.kind,
                "registry changed"
            );
            self.emit(event);
        }

        if let Err(e) = saved {
            warn!(context, error = %e, "failed to persist registry configuration");
            return Err(e.into());
        }
        Ok(out)
    }

    /// Creates an association explicitly.
    ///
    /// Re-registering an existing association with the same table and fields
    /// is a no-op (the description is updated); different fields fail with
    /// `ImmutableField`.
    pub fn register_association(&self, spec: AssociationSpec) -> AssocResult<Association> {
        let candidate = spec.into_association(self.clock.now())?;
        let name = candidate.name().to_string();

        self.mutate("registry.register_association", move |state, _now| {
            if let Some(existing) = state.associations.get_mut(&name) {
                if !existing.same_shape(&candidate) {
                    let field = if existing.table() != candidate.table() {
                        "table"
                    } else if existing.discriminator_field() != candidate.discriminator_field() {
                        "discriminator_field"
                    } else {
                        "id_field"
                    };
                    return Err(ValidationError::ImmutableField {
                        association: name,
                        field: field.to_string(),
                    }
                    .into());
                }
                if candidate.description.is_empty() || existing.description == candidate.description {
                    return Ok(Outcome::Unchanged(existing.clone()));
                }
                existing.description = candidate.description;
                return Ok(Outcome::Changed(existing.clone(), None));
            }
            debug!(association = %name, table = candidate.table(), "association registered");
            state.associations.insert(name, candidate.clone());
            Ok(Outcome::Changed(candidate, None))
        })
    }

    /// Ordered valid target kinds of `association`.
    ///
    /// # Errors
    ///
    /// `UnknownAssociation` if the association is not registered.
    pub fn get_valid_targets(&self, association: &str, include_inactive: bool) -> AssocResult<Vec<String>> {
        let state = self.state.read().map_err(|_| lock_err("registry.get_valid_targets"))?;
        state
            .associations
            .get(association)
            .map(|a| a.target_kinds(include_inactive))
            .ok_or_else(|| AssocError::unknown_association(association))
    }

    /// True if `target_kind` is a valid target of `association`. Never fails;
    /// unknown associations yield false.
    #[must_use]
    pub fn is_valid_target(&self, association: &str, target_kind: &str, include_inactive: bool) -> bool {
        let Ok(state) = self.state.read() else {
            return false;
        };
        state
            .associations
            .get(association)
            .and_then(|a| a.target(target_kind))
            .is_some_and(|t| include_inactive || t.active)
    }

    /// Upserts a target, creating the association (with default field names)
    /// on first use.
    ///
    /// A new target is active with `discovered_at = last_verified_at = now`.
    /// An existing target only has `last_verified_at` refreshed.
    pub fn add_target(
        &self,
        association: &str,
        target_kind: &str,
        display_name: &str,
        provenance: Provenance,
    ) -> AssocResult<TargetMetadata> {
        validate_identifier("association", association)?;
        validate_identifier("target_kind", target_kind)?;
        if display_name.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "display_name".to_string(),
            }
            .into());
        }

        self.mutate("registry.add_target", |state, now| {
            if !state.associations.contains_key(association) {
                let assoc = AssociationSpec::new(association).into_association(now)?;
                state.associations.insert(association.to_string(), assoc);
            }
            let assoc = state
                .associations
                .get_mut(association)
                .ok_or_else(|| AssocError::unknown_association(association))?;

            let target = assoc
                .targets_mut()
                .entry(target_kind.to_string())
                .and_modify(|t| t.last_verified_at = now)
                .or_insert_with(|| TargetMetadata::new(target_kind, display_name, provenance, now))
                .clone();

            let event = RegistryChanged {
                association: association.to_string(),
                target_kind: target_kind.to_string(),
                kind: ChangeKind::Added,
                at: now,
            };
            Ok(Outcome::Changed(target, Some(event)))
        })
    }

    /// Hard-deletes a target.
    pub fn remove_target(&self, association: &str, target_kind: &str) -> AssocResult<TargetMetadata> {
        self.mutate("registry.remove_target", |state, now| {
            let assoc = state
                .associations
                .get_mut(association)
                .ok_or_else(|| AssocError::unknown_association(association))?;
            let removed = assoc
                .targets_mut()
                .remove(target_kind)
                .ok_or_else(|| AssocError::invalid_target(association, target_kind, "not registered"))?;
            let event = RegistryChanged {
                association: association.to_string(),
                target_kind: target_kind.to_string(),
                kind: ChangeKind::Removed,
                at: now,
            };
            Ok(Outcome::Changed(removed, Some(event)))
        })
    }

    /// Marks a target inactive, keeping it for audit.
    pub fn deactivate_target(&self, association: &str, target_kind: &str) -> AssocResult<TargetMetadata> {
        self.set_active(association, target_kind, false, "registry.deactivate_target")
    }

    /// Re-activates a previously deactivated target.
    pub fn activate_target(&self, association: &str, target_kind: &str) -> AssocResult<TargetMetadata> {
        self.set_active(association, target_kind, true, "registry.activate_target")
    }

    fn set_active(
        &self,
        association: &str,
        target_kind: &str,
        active: bool,
        context: &'static str,
    ) -> AssocResult<TargetMetadata> {
        self.mutate(context, |state, now| {
            let assoc = state
                .associations
                .get_mut(association)
                .ok_or_else(|| AssocError::unknown_association(association))?;
            let target = assoc
                .targets_mut()
                .get_mut(target_kind)
                .ok_or_else(|| AssocError::invalid_target(association, target_kind, "not registered"))?;
            target.active = active;
            target.last_verified_at = now;
            let event = RegistryChanged {
                association: association.to_string(),
                target_kind: target_kind.to_string(),
                kind: if active { ChangeKind::Activated } else { ChangeKind::Deactivated },
                at: now,
            };
            Ok(Outcome::Changed(target.clone(), Some(event)))
        })
    }

    /// Snapshot of one association.
    #[must_use]
    pub fn association(&self, name: &str) -> Option<Association> {
        self.state.read().ok()?.associations.get(name).cloned()
    }

    /// Registered association names, ordered.
    #[must_use]
    pub fn associations(&self) -> Vec<String> {
        self.state
            .read()
            .map(|s| s.associations.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Consistent snapshot of the whole configuration.
    pub fn snapshot(&self) -> AssocResult<RegistryConfiguration> {
        let state = self.state.read().map_err(|_| lock_err("registry.snapshot"))?;
        Ok(state.clone())
    }

    /// Structural health check. Never mutates state.
    pub fn validate(&self, include_inactive: bool) -> AssocResult<ValidationReport> {
        let state = self.state.read().map_err(|_| lock_err("registry.validate"))?;
        Ok(validate_configuration(&state, include_inactive))
    }
}
