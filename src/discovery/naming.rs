//! Naming-pattern discovery.
//!
//! Relationship names wired elsewhere in the system follow the convention
//! `<association><TargetKind>` (or `<association>_<target_kind>`). Matching
//! them against each association's name yields target kinds without reading
//! any data.

use regex::Regex;
use tracing::debug;

use crate::association::Association;
use crate::discovery::{DiscoveryResult, DiscoverySource};

/// Confidence assigned to naming-pattern matches.
pub const NAMING_CONFIDENCE: f64 = 0.9;

/// Suffixes that name the association's own fields, not a target kind.
const FIELD_SUFFIXES: &[&str] = &["type", "Type", "id", "Id", "ID"];

fn pattern_for(association: &str) -> Result<Regex, regex::Error> {
    let name = regex::escape(association);
    Regex::new(&format!(r"^{name}(?:_([A-Za-z][A-Za-z0-9_]*)|([A-Z][A-Za-z0-9]*))$"))
}

/// Display name for a target kind: `blog_posts` → `BlogPosts`.
pub(crate) fn display_name(target_kind: &str) -> String {
    target_kind
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect::<String>()
            })
        })
        .collect()
}

/// Target kinds named by `relationship_names` for `association`.
///
/// Already-registered kinds (active or not) and the association's own
/// type/id fields are skipped. Results come back in name order, deduplicated.
pub(crate) fn discover<S: AsRef<str>>(association: &Association, relationship_names: &[S]) -> Vec<DiscoveryResult> {
    let pattern = match pattern_for(association.name()) {
        Ok(p) => p,
        Err(e) => {
            debug!(association = %association.name(), error = %e, "no naming pattern for association");
            return Vec::new();
        }
    };

    let mut kinds: Vec<String> = relationship_names
        .iter()
        .filter_map(|name| {
            let caps = pattern.captures(name.as_ref())?;
            let kind = caps.get(1).or_else(|| caps.get(2))?.as_str();
            (!FIELD_SUFFIXES.contains(&kind)).then(|| kind.to_string())
        })
        .filter(|kind| association.target(kind).is_none())
        .collect();
    kinds.sort();
    kinds.dedup();

    kinds
        .into_iter()
        .map(|kind| DiscoveryResult {
            association: association.name().to_string(),
            display_name: display_name(&kind),
            target_kind: kind,
            confidence: NAMING_CONFIDENCE,
            source: DiscoverySource::NamingPattern,
            pre_validated: true,
            record_count: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::association::{AssociationSpec, Provenance, TargetMetadata};

    fn commentable() -> Association {
        let now = Utc::now();
        let mut assoc = AssociationSpec::new("commentable").into_association(now).unwrap();
        assoc
            .targets_mut()
            .insert("posts".to_string(), TargetMetadata::new("posts", "Post", Provenance::Manual, now));
        assoc
    }

    #[test]
    fn test_extracts_suffixes() {
        let names = [
            "commentableVideo",
            "commentable_photos",
            "commentable_posts",
            "commentable_type",
            "commentableId",
            "taggableVideo",
            "commentable",
            "commentableVideo",
        ];
        let results = discover(&commentable(), &names);
        let kinds: Vec<_> = results.iter().map(|r| r.target_kind.as_str()).collect();
        assert_eq!(kinds, vec!["Video", "photos"]);
        assert!(results.iter().all(|r| r.pre_validated && r.source == DiscoverySource::NamingPattern));
        assert_eq!(results[1].display_name, "Photos");
    }

    #[test]
    fn test_association_name_is_literal() {
        let now = Utc::now();
        let assoc = AssociationSpec::new("a_b").into_association(now).unwrap();
        let results = discover(&assoc, &["aXbPost", "a_bPost"]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].target_kind, "Post");
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("blog_posts"), "BlogPosts");
        assert_eq!(display_name("Video"), "Video");
        assert_eq!(display_name("jobs"), "Jobs");
    }
}
