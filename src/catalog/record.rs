use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::normalization::identity::{is_autogenerated_id, normalize_key};

/// Prefix marking an unpublished CMS document.
pub const DRAFT_PREFIX: &str = "drafts.";

/// Bare document id from a source-qualified one.
pub fn strip_source(id: &str) -> &str {
    id.split_once(':').map(|(_, rest)| rest).unwrap_or(id)
}

/// Which remote catalog a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cms,
    Commerce,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Cms => write!(f, "cms"),
            Source::Commerce => write!(f, "commerce"),
        }
    }
}

impl Source {
    /// Source-qualified record id ("cms:drafts.42ab", "commerce:98123").
    pub fn qualify(&self, raw_id: &str) -> String {
        format!("{self}:{raw_id}")
    }
}

/// Commerce-side identifiers attached to (or discoverable for) a record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalRefs {
    pub product_id: Option<String>,
    #[serde(default)]
    pub variant_ids: Vec<String>,
    pub handle: Option<String>,
}

impl ExternalRefs {
    /// Any commerce identifier counts, the handle included.
    pub fn has_commerce_link(&self) -> bool {
        self.product_id.is_some() || self.handle.is_some() || !self.variant_ids.is_empty()
    }
}

/// Normalized view of one product regardless of source catalog.
///
/// Records are read-only snapshots for the duration of a run; only the
/// remote catalogs persist state between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRecord {
    /// Source-qualified id; globally unique across both catalogs.
    pub id: String,
    pub source: Source,
    /// May be empty, which is itself a defect the audit surfaces.
    pub title: String,
    pub slug: Option<String>,
    #[serde(default)]
    pub external: ExternalRefs,
    /// Catalog section/territory value when the document carries one.
    pub classification: Option<String>,
    pub has_media: bool,
    pub is_draft: bool,
    pub created_at: DateTime<Utc>,
    /// Declared unit size codes ("6ml", "50ml") for variant matching.
    #[serde(default)]
    pub units: Vec<String>,
    /// Every other field from the source document, kept for merges.
    #[serde(default)]
    pub raw_payload: Map<String, Value>,
}

impl CatalogRecord {
    /// Bare document id without the source qualifier.
    pub fn doc_id(&self) -> &str {
        strip_source(&self.id)
    }

    /// Document id with any draft prefix stripped. A draft and its published
    /// counterpart share a base id but remain two distinct records.
    pub fn base_id(&self) -> &str {
        let doc = self.doc_id();
        doc.strip_prefix(DRAFT_PREFIX).unwrap_or(doc)
    }

    /// Authored (slug-style) id rather than a machine-generated one.
    pub fn has_canonical_id(&self) -> bool {
        !is_autogenerated_id(self.base_id())
    }

    pub fn has_title(&self) -> bool {
        !self.title.trim().is_empty()
    }

    pub fn title_key(&self) -> String {
        normalize_key(&self.title)
    }

    pub fn slug_key(&self) -> Option<String> {
        self.slug
            .as_deref()
            .map(normalize_key)
            .filter(|k| !k.is_empty())
    }
}

/// Records sharing one normalized identity.
#[derive(Debug, Clone, Serialize)]
pub struct MatchGroup {
    pub key: String,
    pub members: Vec<CatalogRecord>,
}

impl MatchGroup {
    pub fn is_duplicate_set(&self) -> bool {
        self.members.len() > 1
    }
}

/// A delete the planner refused to emit, and why.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedDelete {
    pub id: String,
    pub reason: String,
}

/// Resolution for one duplicate group: enrich the survivor, delete the rest.
#[derive(Debug, Clone, Serialize)]
pub struct MutationPlan {
    pub group_key: String,
    pub survivor_id: String,
    /// Fields to set on the survivor, sourced from the most informative loser.
    pub patch: Map<String, Value>,
    pub delete_ids: Vec<String>,
    pub skipped: Vec<SkippedDelete>,
}

impl MutationPlan {
    pub fn is_noop(&self) -> bool {
        self.patch.is_empty() && self.delete_ids.is_empty()
    }
}

/// How sure the linker is about a CMS/Commerce pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkConfidence {
    Exact,
    Alias,
    Heuristic,
}

impl fmt::Display for LinkConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkConfidence::Exact => write!(f, "exact"),
            LinkConfidence::Alias => write!(f, "alias"),
            LinkConfidence::Heuristic => write!(f, "heuristic"),
        }
    }
}

/// Commerce attachment proposal for one canonical CMS record.
#[derive(Debug, Clone, Serialize)]
pub struct LinkPlan {
    pub cms_id: String,
    pub commerce_product_id: String,
    /// Declared unit code -> commerce variant id.
    pub commerce_variant_ids: BTreeMap<String, String>,
    /// Declared unit codes with no matching variant SKU; reported, never
    /// defaulted.
    pub unmatched_units: Vec<String>,
    pub confidence: LinkConfidence,
    /// Section reassignment suggested by the heuristic tier; applied only
    /// behind the explicit confirm flag.
    pub proposed_section: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, source: Source) -> CatalogRecord {
        CatalogRecord {
            id: source.qualify(id),
            source,
            title: "Cairo Musk".to_string(),
            slug: Some("cairo-musk".to_string()),
            external: ExternalRefs::default(),
            classification: None,
            has_media: false,
            is_draft: id.starts_with(DRAFT_PREFIX),
            created_at: Utc::now(),
            units: Vec::new(),
            raw_payload: Map::new(),
        }
    }

    #[test]
    fn base_id_strips_draft_prefix_only() {
        let draft = record("drafts.cairo-musk", Source::Cms);
        let published = record("cairo-musk", Source::Cms);
        assert_eq!(draft.doc_id(), "drafts.cairo-musk");
        assert_eq!(draft.base_id(), "cairo-musk");
        assert_eq!(published.base_id(), "cairo-musk");
        assert_ne!(draft.id, published.id);
    }

    #[test]
    fn canonical_id_detection_uses_base_id() {
        let authored = record("cairo-musk", Source::Cms);
        let generated = record("drafts.09139a58-173b-4d07-8339-8a9a25256873", Source::Cms);
        assert!(authored.has_canonical_id());
        assert!(!generated.has_canonical_id());
    }

    #[test]
    fn qualified_ids_are_source_scoped() {
        let cms = record("42", Source::Cms);
        let commerce = record("42", Source::Commerce);
        assert_eq!(cms.id, "cms:42");
        assert_eq!(commerce.id, "commerce:42");
        assert_ne!(cms.id, commerce.id);
    }

    #[test]
    fn blank_titles_and_slugs_read_as_absent() {
        let mut r = record("x1", Source::Cms);
        r.title = "   ".to_string();
        r.slug = Some("  ".to_string());
        assert!(!r.has_title());
        assert_eq!(r.slug_key(), None);
    }
}
