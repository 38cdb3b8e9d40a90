use std::fmt::{self, Write as _};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::{LinkConfidence, LinkPlan, MutationPlan, Source};

/// Phase order for rendering and the JSON snapshot.
const PHASES: [&str; 6] = [
    "fetch",
    "audit",
    "dedupe-plan",
    "dedupe-commit",
    "link-plan",
    "link-commit",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    DryRun,
    Execute,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::DryRun => write!(f, "dry-run"),
            RunMode::Execute => write!(f, "execute"),
        }
    }
}

/// One observation or decision made during a run. The ordered event list is
/// the run's product; logs are only diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReportEvent {
    Fetched {
        source: Source,
        records: usize,
    },
    DraftPair {
        draft_id: String,
        published_id: String,
    },
    ManualAttention {
        id: String,
        reason: String,
    },
    GroupPlanned {
        member_ids: Vec<String>,
        plan: MutationPlan,
    },
    GroupCommitted {
        group_key: String,
        survivor_id: String,
    },
    GroupFailed {
        group_key: String,
        error: String,
    },
    LinkPlanned {
        plan: LinkPlan,
    },
    LinkSkipped {
        cms_id: String,
        reason: String,
    },
    LinkUnmatched {
        cms_id: String,
        title: String,
    },
    /// Heuristic match left uncommitted because the confirm flag was absent.
    LinkHeld {
        cms_id: String,
    },
    LinkCommitted {
        cms_id: String,
        commerce_product_id: String,
    },
    LinkFailed {
        cms_id: String,
        error: String,
    },
}

impl ReportEvent {
    fn phase(&self) -> &'static str {
        match self {
            ReportEvent::Fetched { .. } => "fetch",
            ReportEvent::DraftPair { .. } | ReportEvent::ManualAttention { .. } => "audit",
            ReportEvent::GroupPlanned { .. } => "dedupe-plan",
            ReportEvent::GroupCommitted { .. } | ReportEvent::GroupFailed { .. } => "dedupe-commit",
            ReportEvent::LinkPlanned { .. }
            | ReportEvent::LinkSkipped { .. }
            | ReportEvent::LinkUnmatched { .. } => "link-plan",
            ReportEvent::LinkHeld { .. }
            | ReportEvent::LinkCommitted { .. }
            | ReportEvent::LinkFailed { .. } => "link-commit",
        }
    }

    fn is_commit_phase(&self) -> bool {
        matches!(self.phase(), "dedupe-commit" | "link-commit")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportTotals {
    pub cms_records: usize,
    pub commerce_records: usize,
    pub draft_pairs: usize,
    pub manual_attention: usize,
    pub duplicate_groups: usize,
    pub planned_patch_fields: usize,
    pub planned_deletes: usize,
    pub skipped_deletes: usize,
    pub committed_groups: usize,
    pub group_errors: usize,
    pub links_exact: usize,
    pub links_alias: usize,
    pub links_heuristic: usize,
    pub links_skipped: usize,
    pub links_unmatched: usize,
    pub links_held: usize,
    pub links_committed: usize,
    pub link_errors: usize,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub events: Vec<ReportEvent>,
}

impl RunReport {
    pub fn new(mode: RunMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: Utc::now(),
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, event: ReportEvent) {
        self.events.push(event);
    }

    /// Everything the run decided, excluding commit outcomes. A dry run and
    /// an execute run over the same remote state produce the same view.
    pub fn plan_view(&self) -> Vec<&ReportEvent> {
        self.events.iter().filter(|e| !e.is_commit_phase()).collect()
    }

    pub fn totals(&self) -> ReportTotals {
        let mut totals = ReportTotals::default();
        for event in &self.events {
            match event {
                ReportEvent::Fetched { source, records } => match source {
                    Source::Cms => totals.cms_records = *records,
                    Source::Commerce => totals.commerce_records = *records,
                },
                ReportEvent::DraftPair { .. } => totals.draft_pairs += 1,
                ReportEvent::ManualAttention { .. } => totals.manual_attention += 1,
                ReportEvent::GroupPlanned { plan, .. } => {
                    totals.duplicate_groups += 1;
                    totals.planned_patch_fields += plan.patch.len();
                    totals.planned_deletes += plan.delete_ids.len();
                    totals.skipped_deletes += plan.skipped.len();
                }
                ReportEvent::GroupCommitted { .. } => totals.committed_groups += 1,
                ReportEvent::GroupFailed { .. } => totals.group_errors += 1,
                ReportEvent::LinkPlanned { plan } => match plan.confidence {
                    LinkConfidence::Exact => totals.links_exact += 1,
                    LinkConfidence::Alias => totals.links_alias += 1,
                    LinkConfidence::Heuristic => totals.links_heuristic += 1,
                },
                ReportEvent::LinkSkipped { .. } => totals.links_skipped += 1,
                ReportEvent::LinkUnmatched { .. } => totals.links_unmatched += 1,
                ReportEvent::LinkHeld { .. } => totals.links_held += 1,
                ReportEvent::LinkCommitted { .. } => totals.links_committed += 1,
                ReportEvent::LinkFailed { .. } => totals.link_errors += 1,
            }
        }
        totals
    }

    /// Human-readable rendering, grouped by phase, for stdout.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "== catalog reconciliation report ==");
        let _ = writeln!(
            out,
            "run: {}  mode: {}  started: {}",
            self.run_id,
            self.mode,
            self.started_at.to_rfc3339()
        );
        for phase in PHASES {
            let events: Vec<&ReportEvent> =
                self.events.iter().filter(|e| e.phase() == phase).collect();
            if events.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n-- {phase} --");
            for event in events {
                out.push_str(&event_lines(event));
            }
        }
        let totals = self.totals();
        let _ = writeln!(out, "\n-- totals --");
        let _ = writeln!(
            out,
            "records: {} cms, {} commerce",
            totals.cms_records, totals.commerce_records
        );
        let _ = writeln!(
            out,
            "audit: {} draft pairs, {} need manual attention",
            totals.draft_pairs, totals.manual_attention
        );
        let _ = writeln!(
            out,
            "dedupe: {} duplicate groups, {} patch fields, {} deletes planned, {} skipped, {} committed, {} failed",
            totals.duplicate_groups,
            totals.planned_patch_fields,
            totals.planned_deletes,
            totals.skipped_deletes,
            totals.committed_groups,
            totals.group_errors
        );
        let _ = writeln!(
            out,
            "link: {} exact, {} alias, {} heuristic, {} unmatched, {} skipped, {} held, {} committed, {} failed",
            totals.links_exact,
            totals.links_alias,
            totals.links_heuristic,
            totals.links_unmatched,
            totals.links_skipped,
            totals.links_held,
            totals.links_committed,
            totals.link_errors
        );
        out
    }

    /// JSON snapshot under `dir`, one timestamped file per run.
    pub fn write_snapshot(&self, dir: &Path) -> Result<PathBuf> {
        #[derive(Serialize)]
        struct Snapshot<'a> {
            run_id: Uuid,
            mode: RunMode,
            started_at: String,
            generated_at: String,
            totals: ReportTotals,
            sections: IndexMap<&'static str, Vec<&'a ReportEvent>>,
        }

        let mut sections: IndexMap<&'static str, Vec<&ReportEvent>> = IndexMap::new();
        for phase in PHASES {
            let events: Vec<&ReportEvent> =
                self.events.iter().filter(|e| e.phase() == phase).collect();
            if !events.is_empty() {
                sections.insert(phase, events);
            }
        }
        let snapshot = Snapshot {
            run_id: self.run_id,
            mode: self.mode,
            started_at: self.started_at.to_rfc3339(),
            generated_at: Utc::now().to_rfc3339(),
            totals: self.totals(),
            sections,
        };

        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let ts = Utc::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("recon_report_{ts}.json"));
        fs::write(&path, serde_json::to_string_pretty(&snapshot)?)?;
        Ok(path)
    }
}

fn event_lines(event: &ReportEvent) -> String {
    let mut out = String::new();
    match event {
        ReportEvent::Fetched { source, records } => {
            let _ = writeln!(out, "fetched {source}: {records} records");
        }
        ReportEvent::DraftPair {
            draft_id,
            published_id,
        } => {
            let _ = writeln!(out, "draft pair: {draft_id} shadows {published_id}");
        }
        ReportEvent::ManualAttention { id, reason } => {
            let _ = writeln!(out, "manual attention: {id} ({reason})");
        }
        ReportEvent::GroupPlanned { member_ids, plan } => {
            let _ = writeln!(
                out,
                "group {}: {} members, survivor {}",
                plan.group_key,
                member_ids.len(),
                plan.survivor_id
            );
            if !plan.patch.is_empty() {
                let fields: Vec<&str> = plan.patch.keys().map(|k| k.as_str()).collect();
                let _ = writeln!(out, "  patch fields: {}", fields.join(", "));
            }
            if !plan.delete_ids.is_empty() {
                let _ = writeln!(out, "  delete: {}", plan.delete_ids.join(", "));
            }
            for skip in &plan.skipped {
                let _ = writeln!(out, "  keep {}: {}", skip.id, skip.reason);
            }
        }
        ReportEvent::GroupCommitted {
            group_key,
            survivor_id,
        } => {
            let _ = writeln!(out, "committed group {group_key} (survivor {survivor_id})");
        }
        ReportEvent::GroupFailed { group_key, error } => {
            let _ = writeln!(out, "FAILED group {group_key}: {error}");
        }
        ReportEvent::LinkPlanned { plan } => {
            let _ = writeln!(
                out,
                "link {} -> product {} [{}]",
                plan.cms_id, plan.commerce_product_id, plan.confidence
            );
            if !plan.commerce_variant_ids.is_empty() {
                let pairs: Vec<String> = plan
                    .commerce_variant_ids
                    .iter()
                    .map(|(unit, id)| format!("{unit}={id}"))
                    .collect();
                let _ = writeln!(out, "  variants: {}", pairs.join(", "));
            }
            if !plan.unmatched_units.is_empty() {
                let _ = writeln!(out, "  unmatched units: {}", plan.unmatched_units.join(", "));
            }
            if let Some(section) = &plan.proposed_section {
                let _ = writeln!(out, "  proposed section: {section}");
            }
        }
        ReportEvent::LinkSkipped { cms_id, reason } => {
            let _ = writeln!(out, "skipped {cms_id}: {reason}");
        }
        ReportEvent::LinkUnmatched { cms_id, title } => {
            let _ = writeln!(out, "unmatched {cms_id} ({title:?})");
        }
        ReportEvent::LinkHeld { cms_id } => {
            let _ = writeln!(out, "held {cms_id}: heuristic match awaits confirmation");
        }
        ReportEvent::LinkCommitted {
            cms_id,
            commerce_product_id,
        } => {
            let _ = writeln!(out, "linked {cms_id} -> product {commerce_product_id}");
        }
        ReportEvent::LinkFailed { cms_id, error } => {
            let _ = writeln!(out, "FAILED link {cms_id}: {error}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn sample_plan() -> MutationPlan {
        MutationPlan {
            group_key: "cairo-musk".to_string(),
            survivor_id: "cms:cairo-musk".to_string(),
            patch: Map::new(),
            delete_ids: vec!["cms:x1".to_string()],
            skipped: Vec::new(),
        }
    }

    #[test]
    fn totals_fold_over_events() {
        let mut report = RunReport::new(RunMode::DryRun);
        report.push(ReportEvent::Fetched {
            source: Source::Cms,
            records: 12,
        });
        report.push(ReportEvent::Fetched {
            source: Source::Commerce,
            records: 9,
        });
        report.push(ReportEvent::GroupPlanned {
            member_ids: vec!["cms:cairo-musk".to_string(), "cms:x1".to_string()],
            plan: sample_plan(),
        });
        report.push(ReportEvent::LinkUnmatched {
            cms_id: "cms:zanzibar".to_string(),
            title: "Zanzibar".to_string(),
        });
        let totals = report.totals();
        assert_eq!(totals.cms_records, 12);
        assert_eq!(totals.commerce_records, 9);
        assert_eq!(totals.duplicate_groups, 1);
        assert_eq!(totals.planned_deletes, 1);
        assert_eq!(totals.links_unmatched, 1);
    }

    #[test]
    fn plan_view_excludes_commit_outcomes() {
        let mut report = RunReport::new(RunMode::Execute);
        report.push(ReportEvent::GroupPlanned {
            member_ids: Vec::new(),
            plan: sample_plan(),
        });
        report.push(ReportEvent::GroupCommitted {
            group_key: "cairo-musk".to_string(),
            survivor_id: "cms:cairo-musk".to_string(),
        });
        assert_eq!(report.plan_view().len(), 1);
    }

    #[test]
    fn text_rendering_sections_and_totals() {
        let mut report = RunReport::new(RunMode::DryRun);
        report.push(ReportEvent::Fetched {
            source: Source::Cms,
            records: 3,
        });
        report.push(ReportEvent::GroupPlanned {
            member_ids: vec!["cms:cairo-musk".to_string(), "cms:x1".to_string()],
            plan: sample_plan(),
        });
        let text = report.render_text();
        assert!(text.contains("-- fetch --"));
        assert!(text.contains("-- dedupe-plan --"));
        assert!(text.contains("group cairo-musk: 2 members, survivor cms:cairo-musk"));
        assert!(text.contains("-- totals --"));
        assert!(!text.contains("-- link-commit --"));
    }

    #[test]
    fn snapshot_writes_one_json_file() {
        let report = RunReport::new(RunMode::DryRun);
        let dir = std::env::temp_dir().join(format!("recon-test-{}", Uuid::new_v4()));
        let path = report.write_snapshot(&dir).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["mode"], "dry-run");
        assert!(parsed["totals"].is_object());
        let _ = fs::remove_dir_all(&dir);
    }
}
