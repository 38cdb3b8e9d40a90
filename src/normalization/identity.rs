use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::warn;

use crate::util::env::env_opt;

/// Minimum similarity score (Jaro-Winkler) required before the heuristic
/// linker tier will treat two normalized titles as the same product.
pub const MIN_TITLE_SIMILARITY: f64 = 0.92;

/// Collapse a free-text title or handle into a comparison key.
///
/// Steps: lowercase, collapse every run of characters outside `[a-z0-9]`
/// into a single `-`, trim leading/trailing `-`. The function is idempotent:
/// applying it to its own output changes nothing.
pub fn normalize_key(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut pending_dash = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("uuid pattern")
    })
}

fn opaque_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9]{12,}$").expect("opaque id pattern"))
}

fn unit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*([a-z]+)").expect("unit pattern"))
}

/// Whether a base document id looks machine-generated rather than authored.
///
/// Authored ids are short hyphenated slugs. Generated ids are UUIDs or long
/// opaque alphanumeric strings carrying at least one digit.
pub fn is_autogenerated_id(base_id: &str) -> bool {
    if uuid_re().is_match(base_id) {
        return true;
    }
    opaque_re().is_match(base_id) && base_id.chars().any(|c| c.is_ascii_digit())
}

/// Jaro-Winkler similarity between two normalized keys.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    jaro_winkler(a, b)
}

/// Variant SKUs encode the unit as an uppercase suffix ("CM-6ML").
pub fn sku_matches_unit(sku: &str, unit: &str) -> bool {
    let sku = sku.trim().to_ascii_uppercase();
    let unit = unit.trim().to_ascii_uppercase();
    !unit.is_empty() && sku.ends_with(&format!("-{unit}"))
}

/// Versioned matching tables shared by the grouper and the linker.
///
/// The compiled-in tables cover the known catalog; operators can override
/// them wholesale or per-table with `RECON_MATCH_CONFIG` (inline JSON) or
/// `RECON_MATCH_CONFIG_FILE` (path to a JSON file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Symmetric multi-spelling pairs; folded into one duplicate group.
    #[serde(default = "builtin_spelling_aliases")]
    pub spelling_aliases: Vec<(String, String)>,
    /// Curated historical renamings: CMS title key -> Commerce handle key.
    #[serde(default = "builtin_link_aliases")]
    pub link_aliases: BTreeMap<String, String>,
    /// Marketing tails stripped before heuristic title comparison.
    #[serde(default = "builtin_decorative_suffixes")]
    pub decorative_suffixes: Vec<String>,
    /// Section name -> keyword vocabulary for category inference.
    #[serde(default = "builtin_section_keywords")]
    pub section_keywords: BTreeMap<String, Vec<String>>,
    /// Recognized unit suffixes for variant size codes.
    #[serde(default = "builtin_unit_suffixes")]
    pub unit_suffixes: Vec<String>,
    #[serde(default = "default_min_similarity")]
    pub min_title_similarity: f64,
    #[serde(skip)]
    alias_members: BTreeMap<String, BTreeSet<String>>,
}

fn default_version() -> u32 {
    1
}

fn default_min_similarity() -> f64 {
    MIN_TITLE_SIMILARITY
}

fn builtin_spelling_aliases() -> Vec<(String, String)> {
    [
        ("del-mar", "delmar"),
        ("del-mare", "del-mar"),
        ("okoume", "okume"),
        ("ylang-ylang", "ylang"),
    ]
    .into_iter()
    .map(|(a, b)| (a.to_string(), b.to_string()))
    .collect()
}

fn builtin_link_aliases() -> BTreeMap<String, String> {
    [
        ("del-mare", "delmar"),
        ("del-mar", "delmar"),
        ("ylang", "ylang-ylang"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn builtin_decorative_suffixes() -> Vec<String> {
    [
        "eau-de-parfum",
        "extrait-de-parfum",
        "extrait",
        "parfum",
        "edp",
        "discovery-set",
        "travel-size",
        "limited-edition",
        "tester",
        "sample",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn builtin_section_keywords() -> BTreeMap<String, Vec<String>> {
    let essence = [
        "oud", "wood", "woods", "sandalwood", "cedar", "resin", "amber", "musk", "incense",
        "vetiver", "labdanum",
    ];
    let territory = [
        "cairo", "kyoto", "sahara", "andalusia", "provence", "delos", "zanzibar", "patagonia",
        "atlas", "bergen",
    ];
    BTreeMap::from([
        (
            "essence".to_string(),
            essence.into_iter().map(str::to_string).collect(),
        ),
        (
            "territory".to_string(),
            territory.into_iter().map(str::to_string).collect(),
        ),
    ])
}

fn builtin_unit_suffixes() -> Vec<String> {
    ["ml", "g", "oz"].into_iter().map(str::to_string).collect()
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self::builtin()
    }
}

impl MatchConfig {
    /// The compiled-in tables. `load()` is the usual entry point.
    pub fn builtin() -> Self {
        Self {
            version: default_version(),
            spelling_aliases: builtin_spelling_aliases(),
            link_aliases: builtin_link_aliases(),
            decorative_suffixes: builtin_decorative_suffixes(),
            section_keywords: builtin_section_keywords(),
            unit_suffixes: builtin_unit_suffixes(),
            min_title_similarity: default_min_similarity(),
            alias_members: BTreeMap::new(),
        }
        .finalized()
    }

    /// Resolve the active configuration: inline JSON via `RECON_MATCH_CONFIG`,
    /// then a file path via `RECON_MATCH_CONFIG_FILE`, else the compiled-in
    /// tables. Parse failures fall back with a warning rather than aborting.
    pub fn load() -> Self {
        let parsed: Option<MatchConfig> = env_opt("RECON_MATCH_CONFIG")
            .and_then(|raw| match serde_json::from_str(&raw) {
                Ok(cfg) => Some(cfg),
                Err(err) => {
                    warn!(error = %err, "RECON_MATCH_CONFIG was set but could not be parsed as JSON");
                    None
                }
            })
            .or_else(|| {
                let path = env_opt("RECON_MATCH_CONFIG_FILE")?;
                let raw = match std::fs::read_to_string(&path) {
                    Ok(raw) => raw,
                    Err(err) => {
                        warn!(path = %path, error = %err, "failed to read RECON_MATCH_CONFIG_FILE");
                        return None;
                    }
                };
                match serde_json::from_str(&raw) {
                    Ok(cfg) => Some(cfg),
                    Err(err) => {
                        warn!(path = %path, error = %err, "RECON_MATCH_CONFIG_FILE contained invalid JSON");
                        None
                    }
                }
            });
        match parsed {
            Some(cfg) => cfg.finalized(),
            None => Self::builtin(),
        }
    }

    /// Normalize every table entry and close the spelling pairs into
    /// connected components so any member expands to the full set regardless
    /// of how the pairs were written.
    fn finalized(mut self) -> Self {
        self.spelling_aliases = self
            .spelling_aliases
            .iter()
            .map(|(a, b)| (normalize_key(a), normalize_key(b)))
            .filter(|(a, b)| !a.is_empty() && !b.is_empty() && a != b)
            .collect();
        self.link_aliases = self
            .link_aliases
            .iter()
            .map(|(k, v)| (normalize_key(k), normalize_key(v)))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect();
        self.decorative_suffixes = self
            .decorative_suffixes
            .iter()
            .map(|s| normalize_key(s))
            .filter(|s| !s.is_empty())
            .collect();
        // Longest suffix first so compound tails win over their own pieces.
        self.decorative_suffixes
            .sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        self.decorative_suffixes.dedup();
        for words in self.section_keywords.values_mut() {
            *words = words
                .iter()
                .map(|w| normalize_key(w))
                .filter(|w| !w.is_empty())
                .collect();
        }
        self.unit_suffixes = self
            .unit_suffixes
            .iter()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let mut adjacency: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (a, b) in &self.spelling_aliases {
            adjacency.entry(a.clone()).or_default().insert(b.clone());
            adjacency.entry(b.clone()).or_default().insert(a.clone());
        }
        self.alias_members.clear();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for start in adjacency.keys() {
            if seen.contains(start) {
                continue;
            }
            let mut component: BTreeSet<String> = BTreeSet::new();
            let mut queue = vec![start.clone()];
            while let Some(node) = queue.pop() {
                if !component.insert(node.clone()) {
                    continue;
                }
                if let Some(nexts) = adjacency.get(&node) {
                    for n in nexts {
                        if !component.contains(n) {
                            queue.push(n.clone());
                        }
                    }
                }
            }
            for member in &component {
                seen.insert(member.clone());
                self.alias_members.insert(member.clone(), component.clone());
            }
        }
        self
    }

    /// Every spelling equivalent to `key`, including `key` itself.
    pub fn expand_aliases(&self, key: &str) -> BTreeSet<String> {
        match self.alias_members.get(key) {
            Some(members) => members.clone(),
            None => BTreeSet::from([key.to_string()]),
        }
    }

    pub fn alias_equivalent(&self, a: &str, b: &str) -> bool {
        a == b || self.expand_aliases(a).contains(b)
    }

    /// Stable group key: the alphabetically first spelling among the alias set.
    pub fn group_key(&self, key: &str) -> String {
        self.expand_aliases(key)
            .into_iter()
            .next()
            .unwrap_or_else(|| key.to_string())
    }

    /// Curated historical renaming for the linker's alias tier.
    pub fn linked_handle(&self, title_key: &str) -> Option<&str> {
        self.link_aliases.get(title_key).map(|s| s.as_str())
    }

    /// Strip recognized marketing tails ("-eau-de-parfum", "-tester", ...)
    /// from the end of a key, repeatedly, without ever emptying it.
    pub fn strip_decorative(&self, key: &str) -> String {
        let mut out = key.to_string();
        loop {
            let mut changed = false;
            for suffix in &self.decorative_suffixes {
                let tail = format!("-{suffix}");
                if out.ends_with(&tail) {
                    out.truncate(out.len() - tail.len());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        out
    }

    /// Infer a catalog section from keyword vocabulary. Returns None when no
    /// section matches or when two sections tie; ambiguity is never guessed.
    pub fn infer_section(&self, key: &str) -> Option<&str> {
        let padded = format!("-{key}-");
        let mut best: Option<(&str, usize)> = None;
        let mut tied = false;
        for (section, words) in &self.section_keywords {
            let hits = words
                .iter()
                .filter(|w| padded.contains(&format!("-{w}-")))
                .count();
            if hits == 0 {
                continue;
            }
            match best {
                None => {
                    best = Some((section, hits));
                    tied = false;
                }
                Some((_, top)) if hits > top => {
                    best = Some((section, hits));
                    tied = false;
                }
                Some((_, top)) if hits == top => {
                    tied = true;
                }
                _ => {}
            }
        }
        if tied {
            None
        } else {
            best.map(|(section, _)| section)
        }
    }

    /// Pull the first recognized unit code out of a size label
    /// ("Eau de Parfum 50 ML" -> "50ml").
    pub fn extract_unit(&self, label: &str) -> Option<String> {
        for caps in unit_re().captures_iter(label) {
            let (Some(qty), Some(suffix)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let suffix = suffix.as_str().to_ascii_lowercase();
            if self.unit_suffixes.iter().any(|s| s == &suffix) {
                let qty = qty.as_str().replace(',', ".");
                return Some(format!("{qty}{suffix}"));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_and_is_idempotent() {
        assert_eq!(normalize_key("  Cairo   Musk!! "), "cairo-musk");
        assert_eq!(normalize_key("Nº 7 — Delos"), "n-7-delos");
        let once = normalize_key("Velvet & Co. Extrait");
        assert_eq!(normalize_key(&once), once);
    }

    #[test]
    fn autogenerated_id_shapes() {
        assert!(is_autogenerated_id("09139a58-173b-4d07-8339-8a9a25256873"));
        assert!(is_autogenerated_id("J4fU29M0mDYxane2fdjuuP"));
        assert!(!is_autogenerated_id("cairo-musk"));
        assert!(!is_autogenerated_id("cairomusk"));
        assert!(!is_autogenerated_id("product-cairo-musk"));
    }

    #[test]
    fn alias_expansion_is_symmetric_and_transitive() {
        let cfg = MatchConfig::builtin();
        for (a, b) in &cfg.spelling_aliases {
            assert!(cfg.expand_aliases(a).contains(b), "{a} should expand to {b}");
            assert!(cfg.expand_aliases(b).contains(a), "{b} should expand to {a}");
        }
        // del-mare and delmar are only connected through del-mar.
        assert!(cfg.alias_equivalent("del-mare", "delmar"));
        assert_eq!(cfg.group_key("delmar"), cfg.group_key("del-mare"));
        assert_eq!(cfg.group_key("delmar"), cfg.group_key("del-mar"));
    }

    #[test]
    fn unknown_key_expands_to_itself() {
        let cfg = MatchConfig::builtin();
        let set = cfg.expand_aliases("cairo-musk");
        assert_eq!(set.len(), 1);
        assert!(set.contains("cairo-musk"));
        assert_eq!(cfg.group_key("cairo-musk"), "cairo-musk");
    }

    #[test]
    fn strips_decorative_tails_repeatedly() {
        let cfg = MatchConfig::builtin();
        assert_eq!(cfg.strip_decorative("cairo-musk-eau-de-parfum"), "cairo-musk");
        assert_eq!(
            cfg.strip_decorative("delos-extrait-de-parfum-tester"),
            "delos"
        );
        assert_eq!(cfg.strip_decorative("cairo-musk"), "cairo-musk");
    }

    #[test]
    fn section_inference_counts_hits_and_refuses_ties() {
        let cfg = MatchConfig::builtin();
        assert_eq!(cfg.infer_section("oud-amber-noir"), Some("essence"));
        assert_eq!(cfg.infer_section("route-de-kyoto"), Some("territory"));
        // one essence word and one territory word: ambiguous, no guess
        assert_eq!(cfg.infer_section("cairo-musk"), None);
        assert_eq!(cfg.infer_section("velvet-iris"), None);
    }

    #[test]
    fn extracts_unit_codes_from_size_labels() {
        let cfg = MatchConfig::builtin();
        assert_eq!(cfg.extract_unit("6 ml"), Some("6ml".to_string()));
        assert_eq!(cfg.extract_unit("Eau de Parfum 50ML"), Some("50ml".to_string()));
        assert_eq!(
            cfg.extract_unit("10 Year Anniversary 50ml"),
            Some("50ml".to_string())
        );
        assert_eq!(cfg.extract_unit("discovery set"), None);
    }

    #[test]
    fn sku_unit_suffix_matching() {
        assert!(sku_matches_unit("CM-6ML", "6ml"));
        assert!(sku_matches_unit("delmar-50ml", "50ML"));
        assert!(!sku_matches_unit("CM-50ML", "6ml"));
        assert!(!sku_matches_unit("CM6ML", "6ml"));
    }

    #[test]
    fn partial_override_keeps_builtin_defaults() {
        let cfg: MatchConfig =
            serde_json::from_str(r#"{"version":2,"link_aliases":{"Old Name":"new-handle"}}"#)
                .expect("parse override");
        let cfg = cfg.finalized();
        assert_eq!(cfg.version, 2);
        assert_eq!(cfg.linked_handle("old-name"), Some("new-handle"));
        // untouched tables fall back to the compiled-in ones
        assert!(!cfg.spelling_aliases.is_empty());
        assert!(cfg.infer_section("oud-amber-noir").is_some());
    }

    #[test]
    fn near_titles_clear_similarity_floor() {
        assert!(title_similarity("cairo-musk", "cairo-musc") >= MIN_TITLE_SIMILARITY);
        assert!(title_similarity("cairo-musk", "delos-ambre") < MIN_TITLE_SIMILARITY);
    }
}
