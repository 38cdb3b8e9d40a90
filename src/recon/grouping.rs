use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::catalog::{CatalogRecord, MatchGroup, Source};
use crate::normalization::MatchConfig;

/// A record the engine refuses to group or mutate automatically.
#[derive(Debug, Clone, Serialize)]
pub struct ManualAttention {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupedCatalog {
    pub groups: Vec<MatchGroup>,
    pub manual_attention: Vec<ManualAttention>,
}

/// Partition CMS records into identity groups.
///
/// Primary pass keys on the normalized title, with alias spellings folded
/// into one group. A record whose title is missing or normalizes to nothing
/// (all-symbol, non-Latin) has no title identity; it only reaches a group
/// through its slug, and anything that matches nothing lands in the
/// manual-attention bucket.
pub fn group_records(records: &[CatalogRecord], config: &MatchConfig) -> GroupedCatalog {
    let mut by_key: BTreeMap<String, Vec<CatalogRecord>> = BTreeMap::new();
    let mut titleless: Vec<&CatalogRecord> = Vec::new();
    let mut manual_attention = Vec::new();

    for rec in records {
        let title_key = rec.title_key();
        if title_key.is_empty() {
            titleless.push(rec);
        } else {
            let key = config.group_key(&title_key);
            by_key.entry(key).or_default().push(rec.clone());
        }
    }

    for rec in titleless {
        match rec.slug_key() {
            Some(slug) => {
                let key = config.group_key(&slug);
                if let Some(members) = by_key.get_mut(&key) {
                    debug!(id = %rec.id, key = %key, "titleless record joined group via slug");
                    members.push(rec.clone());
                } else {
                    manual_attention.push(ManualAttention {
                        id: rec.id.clone(),
                        reason: "no usable title; slug matches no group".to_string(),
                    });
                }
            }
            None => manual_attention.push(ManualAttention {
                id: rec.id.clone(),
                reason: "no usable title or slug".to_string(),
            }),
        }
    }

    let groups = by_key
        .into_iter()
        .map(|(key, members)| MatchGroup { key, members })
        .collect();
    GroupedCatalog {
        groups,
        manual_attention,
    }
}

/// Draft/published pairs sharing one base id. Reported, never collapsed.
pub fn draft_pairs(records: &[CatalogRecord]) -> Vec<(String, String)> {
    let mut draft_by_base: BTreeMap<&str, &str> = BTreeMap::new();
    let mut published_by_base: BTreeMap<&str, &str> = BTreeMap::new();
    for rec in records.iter().filter(|r| r.source == Source::Cms) {
        if rec.is_draft {
            draft_by_base.insert(rec.base_id(), rec.id.as_str());
        } else {
            published_by_base.insert(rec.base_id(), rec.id.as_str());
        }
    }
    draft_by_base
        .iter()
        .filter_map(|(base, draft_id)| {
            published_by_base
                .get(base)
                .map(|published_id| (draft_id.to_string(), published_id.to_string()))
        })
        .collect()
}

/// Canonicality score. Higher keeps the record.
pub fn score_record(rec: &CatalogRecord) -> i32 {
    let mut score = 0;
    if rec.has_canonical_id() {
        score += 100;
    }
    if !rec.is_draft {
        score += 50;
    }
    if rec.slug_key().is_some() {
        score += 10;
    }
    if rec.has_media {
        score += 10;
    }
    if rec.classification.is_some() {
        score += 10;
    }
    if rec.external.has_commerce_link() {
        score += 5;
    }
    score
}

fn signals(rec: &CatalogRecord) -> [bool; 6] {
    [
        rec.has_canonical_id(),
        !rec.is_draft,
        rec.slug_key().is_some(),
        rec.has_media,
        rec.classification.is_some(),
        rec.external.has_commerce_link(),
    ]
}

/// Total order over group members; `Greater` means preferred as survivor.
///
/// Score first, then the individual signals in score order, then age
/// (older record wins), then base id as the final anchor so the outcome
/// never depends on input order.
pub fn compare_precedence(a: &CatalogRecord, b: &CatalogRecord) -> Ordering {
    score_record(a)
        .cmp(&score_record(b))
        .then_with(|| signals(a).cmp(&signals(b)))
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| b.base_id().cmp(a.base_id()))
}

pub fn select_survivor(group: &MatchGroup) -> Option<&CatalogRecord> {
    group.members.iter().max_by(|a, b| compare_precedence(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ExternalRefs, DRAFT_PREFIX};
    use chrono::{TimeZone, Utc};
    use serde_json::Map;

    fn rec(id: &str, title: &str) -> CatalogRecord {
        CatalogRecord {
            id: Source::Cms.qualify(id),
            source: Source::Cms,
            title: title.to_string(),
            slug: None,
            external: ExternalRefs::default(),
            classification: None,
            has_media: false,
            is_draft: id.starts_with(DRAFT_PREFIX),
            created_at: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            units: Vec::new(),
            raw_payload: Map::new(),
        }
    }

    #[test]
    fn groups_by_normalized_title_with_alias_folding() {
        let config = MatchConfig::builtin();
        let records = vec![
            rec("del-mar", "Del Mar"),
            rec("x7k2jf8a7q1z", "Delmar"),
            rec("kyoto", "Kyoto"),
        ];
        let grouped = group_records(&records, &config);
        assert_eq!(grouped.groups.len(), 2);
        let del_mar = grouped
            .groups
            .iter()
            .find(|g| g.members.len() == 2)
            .unwrap();
        assert!(del_mar.is_duplicate_set());
        assert!(grouped.manual_attention.is_empty());
    }

    #[test]
    fn titleless_record_joins_group_through_slug() {
        let config = MatchConfig::builtin();
        let mut orphan = rec("b4n9q2w8e1r5", "");
        orphan.slug = Some("kyoto".to_string());
        let records = vec![rec("kyoto", "Kyoto"), orphan];
        let grouped = group_records(&records, &config);
        assert_eq!(grouped.groups.len(), 1);
        assert_eq!(grouped.groups[0].members.len(), 2);
        assert!(grouped.manual_attention.is_empty());
    }

    #[test]
    fn titleless_records_route_to_manual_attention() {
        let config = MatchConfig::builtin();
        let mut stray_slug = rec("c8m3t6y1u4i7", "");
        stray_slug.slug = Some("nothing-like-this".to_string());
        let bare = rec("d2f5g8h1j4k7", "");
        let records = vec![stray_slug, bare];
        let grouped = group_records(&records, &config);
        assert!(grouped.groups.is_empty());
        assert_eq!(grouped.manual_attention.len(), 2);
        assert_eq!(
            grouped.manual_attention[0].reason,
            "no usable title; slug matches no group"
        );
        assert_eq!(grouped.manual_attention[1].reason, "no usable title or slug");
    }

    #[test]
    fn symbol_only_titles_never_share_a_group() {
        let config = MatchConfig::builtin();
        let starred = rec("f4g7h1j9k2l5", "★★★");
        let shouting = rec("z8x3c6v9b2n5", "!!!");
        let grouped = group_records(&[starred, shouting], &config);
        assert!(grouped.groups.is_empty());
        assert_eq!(grouped.manual_attention.len(), 2);
    }

    #[test]
    fn symbol_only_title_reaches_its_group_through_slug() {
        let config = MatchConfig::builtin();
        let mut decorated = rec("m2n5b8v1c4x7", "♦♦♦");
        decorated.slug = Some("kyoto".to_string());
        let grouped = group_records(&[rec("kyoto", "Kyoto"), decorated], &config);
        assert_eq!(grouped.groups.len(), 1);
        assert_eq!(grouped.groups[0].members.len(), 2);
        assert!(grouped.manual_attention.is_empty());
    }

    #[test]
    fn canonical_published_record_outscores_the_rest() {
        let mut canonical = rec("cairo-musk", "Cairo Musk");
        canonical.slug = Some("cairo-musk".to_string());
        canonical.has_media = true;
        canonical.classification = Some("essence".to_string());

        let draft = rec("drafts.w9x2c5v8b1n4", "Cairo Musk");

        let mut linked = rec("p3o6i9u2y5t8", "Cairo Musk");
        linked.external.product_id = Some("98123".to_string());

        assert_eq!(score_record(&canonical), 180);
        assert_eq!(score_record(&draft), 0);
        assert_eq!(score_record(&linked), 55);

        let group = MatchGroup {
            key: "cairo-musk".to_string(),
            members: vec![draft, linked, canonical.clone()],
        };
        assert_eq!(select_survivor(&group).unwrap().id, canonical.id);
    }

    #[test]
    fn commerce_handle_alone_scores_as_linked() {
        let mut handled = rec("u3i6o9p2a5s8", "Verona");
        handled.external.handle = Some("verona".to_string());
        assert_eq!(score_record(&handled), 55);
        assert!(signals(&handled)[5]);
    }

    #[test]
    fn tied_scores_fall_back_to_older_record() {
        let mut older = rec("atlas", "Atlas");
        older.created_at = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
        let newer = rec("atlas-2", "Atlas");
        let group = MatchGroup {
            key: "atlas".to_string(),
            members: vec![newer, older.clone()],
        };
        assert_eq!(select_survivor(&group).unwrap().id, older.id);
    }

    #[test]
    fn survivor_choice_ignores_input_order() {
        let config = MatchConfig::builtin();
        let mut canonical = rec("sahara", "Sahara");
        canonical.slug = Some("sahara".to_string());
        let dup = rec("q1w2e3r4t5y6", "Sahara");

        let forward = group_records(&[canonical.clone(), dup.clone()], &config);
        let reverse = group_records(&[dup, canonical.clone()], &config);
        let pick = |g: &GroupedCatalog| {
            select_survivor(&g.groups[0]).map(|r| r.id.clone()).unwrap()
        };
        assert_eq!(pick(&forward), pick(&reverse));
        assert_eq!(pick(&forward), canonical.id);
    }

    #[test]
    fn draft_published_pairs_are_detected() {
        let records = vec![
            rec("cairo-musk", "Cairo Musk"),
            rec("drafts.cairo-musk", "Cairo Musk"),
            rec("kyoto", "Kyoto"),
        ];
        let pairs = draft_pairs(&records);
        assert_eq!(
            pairs,
            vec![("cms:drafts.cairo-musk".to_string(), "cms:cairo-musk".to_string())]
        );
    }
}
