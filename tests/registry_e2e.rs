use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use kyro_assoc::storage::InMemoryConfigStore;
use kyro_assoc::time::{Clock, ManualClock};
use kyro_assoc::{
    AssociationRegistry, AssociationSpec, ChangeEvent, ChangeKind, ChannelListener, JsonFileConfigStore, Provenance,
};

fn manual_registry() -> (Arc<ManualClock>, AssociationRegistry) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let registry = AssociationRegistry::with_clock(clock.clone());
    (clock, registry)
}

#[test]
fn register_then_add_target_lists_it() {
    let (_, registry) = manual_registry();
    registry.register_association(AssociationSpec::new("loggable")).unwrap();
    assert!(registry.get_valid_targets("loggable", false).unwrap().is_empty());

    registry.add_target("loggable", "jobs", "Job", Provenance::Manual).unwrap();
    assert_eq!(registry.get_valid_targets("loggable", false).unwrap(), vec!["jobs"]);
}

#[test]
fn valid_target_tracks_add_and_remove() {
    let (_, registry) = manual_registry();
    for kind in ["jobs", "tasks", "invoices"] {
        registry.add_target("loggable", kind, "Display", Provenance::Manual).unwrap();
        assert!(registry.is_valid_target("loggable", kind, false));
    }
    registry.remove_target("loggable", "tasks").unwrap();
    assert!(!registry.is_valid_target("loggable", "tasks", true));
    assert!(registry.is_valid_target("loggable", "jobs", false));
}

#[test]
fn add_target_is_idempotent() {
    let (clock, registry) = manual_registry();
    let first = registry.add_target("loggable", "jobs", "Job", Provenance::Manual).unwrap();
    clock.advance(ChronoDuration::seconds(10));
    let second = registry.add_target("loggable", "jobs", "Job", Provenance::Manual).unwrap();

    let assoc = registry.association("loggable").unwrap();
    assert_eq!(assoc.target_count(), 1);
    assert_eq!(second.discovered_at, first.discovered_at);
    assert_eq!(second.last_verified_at, clock.now());
    assert!(second.last_verified_at > first.last_verified_at);
}

#[test]
fn deactivate_keeps_target_for_audit() {
    let (_, registry) = manual_registry();
    registry.add_target("loggable", "jobs", "Job", Provenance::Manual).unwrap();
    registry.add_target("loggable", "tasks", "Task", Provenance::Runtime).unwrap();

    registry.deactivate_target("loggable", "jobs").unwrap();
    assert_eq!(registry.get_valid_targets("loggable", false).unwrap(), vec!["tasks"]);
    assert_eq!(registry.get_valid_targets("loggable", true).unwrap(), vec!["jobs", "tasks"]);

    let report = registry.validate(true).unwrap();
    assert!(report.is_valid());
    assert_eq!(report.warnings.len(), 1);

    registry.activate_target("loggable", "jobs").unwrap();
    assert!(registry.is_valid_target("loggable", "jobs", false));
}

#[test]
fn unknown_association_fails_fast() {
    let (_, registry) = manual_registry();
    assert!(registry.get_valid_targets("taggable", false).unwrap_err().is_unknown_association());
    assert!(registry.remove_target("taggable", "posts").unwrap_err().is_unknown_association());
}

#[test]
fn listeners_see_every_mutation_in_order() {
    let (_, registry) = manual_registry();
    let (listener, rx) = ChannelListener::new(16);
    registry.subscribe(Arc::new(listener));

    registry.add_target("loggable", "jobs", "Job", Provenance::Manual).unwrap();
    registry.deactivate_target("loggable", "jobs").unwrap();
    registry.activate_target("loggable", "jobs").unwrap();
    registry.remove_target("loggable", "jobs").unwrap();

    let kinds: Vec<ChangeKind> = rx
        .try_iter()
        .filter_map(|e| match e {
            ChangeEvent::Registry(changed) => Some(changed.kind),
            ChangeEvent::Cache(_) => None,
        })
        .collect();
    assert_eq!(
        kinds,
        vec![ChangeKind::Added, ChangeKind::Deactivated, ChangeKind::Activated, ChangeKind::Removed]
    );
}

#[test]
fn every_mutation_is_persisted() {
    let store = Arc::new(InMemoryConfigStore::new());
    let registry = AssociationRegistry::open(store.clone(), Arc::new(ManualClock::default())).unwrap();

    registry.add_target("loggable", "jobs", "Job", Provenance::Manual).unwrap();
    registry.add_target("loggable", "tasks", "Task", Provenance::Manual).unwrap();
    assert_eq!(store.save_count(), 2);

    let stored = store.stored().unwrap();
    assert_eq!(stored.metadata.total_targets, 2);
    assert_eq!(stored, registry.snapshot().unwrap());
}

#[test]
fn save_failure_keeps_in_memory_change() {
    let store = Arc::new(InMemoryConfigStore::new());
    let registry = AssociationRegistry::open(store.clone(), Arc::new(ManualClock::default())).unwrap();
    store.set_fail_saves(true);

    let err = registry.add_target("loggable", "jobs", "Job", Provenance::Manual).unwrap_err();
    assert!(err.is_persistence());
    assert!(registry.is_valid_target("loggable", "jobs", false));
}

#[test]
fn json_file_store_round_trips_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("associations.json");

    {
        let registry =
            AssociationRegistry::open(Arc::new(JsonFileConfigStore::new(&path)), Arc::new(ManualClock::default()))
                .unwrap();
        registry
            .register_association(
                AssociationSpec::new("commentable")
                    .table("comments")
                    .description("Things people comment on"),
            )
            .unwrap();
        registry.add_target("commentable", "posts", "Post", Provenance::Manual).unwrap();
        registry.add_target("commentable", "videos", "Video", Provenance::Generated).unwrap();
        registry.deactivate_target("commentable", "videos").unwrap();
    }

    let reopened =
        AssociationRegistry::open(Arc::new(JsonFileConfigStore::new(&path)), Arc::new(ManualClock::default())).unwrap();
    let assoc = reopened.association("commentable").unwrap();
    assert_eq!(assoc.table(), "comments");
    assert_eq!(assoc.discriminator_field(), "commentable_type");
    assert_eq!(reopened.get_valid_targets("commentable", false).unwrap(), vec!["posts"]);
    assert_eq!(reopened.get_valid_targets("commentable", true).unwrap(), vec!["posts", "videos"]);
    assert_eq!(assoc.target("videos").unwrap().provenance, Provenance::Generated);
}

#[test]
fn reregistering_with_other_fields_is_rejected() {
    let (_, registry) = manual_registry();
    registry
        .register_association(AssociationSpec::new("commentable").table("comments"))
        .unwrap();
    registry
        .register_association(AssociationSpec::new("commentable").table("comments"))
        .unwrap();

    let err = registry
        .register_association(AssociationSpec::new("commentable").table("notes"))
        .unwrap_err();
    assert!(err.is_validation());
}
