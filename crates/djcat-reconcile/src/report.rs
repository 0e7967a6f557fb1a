use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use djcat_core::Tier;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ApplySummary, CatalogAudit, CorrectionOutcome, GroupResult, SkipReason, TierResult};

pub const ALL_PASSED: &str = "all checks passed";

/// Provenance of one run, written next to the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: Uuid,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub store_backend: String,
    pub reference_fingerprint: String,
    pub substring_match: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// No missing or extra members and no tier violations. With an audit
    /// attached, its findings (see `CatalogAudit::issue_count`) count too.
    pub ok: bool,
    pub issue_count: usize,
    pub groups: GroupResult,
    pub tiers: TierResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply: Option<ApplySummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<CatalogAudit>,
}

pub fn format_report(
    groups: &GroupResult,
    tiers: &TierResult,
    apply: Option<&ApplySummary>,
) -> Report {
    let group_issues: usize = groups.values().map(|d| d.missing.len() + d.extra.len()).sum();
    let tier_issues: usize = tiers.values().map(|c| c.violations.len()).sum();
    let issue_count = group_issues + tier_issues;
    Report {
        ok: issue_count == 0,
        issue_count,
        groups: groups.clone(),
        tiers: tiers.clone(),
        apply: apply.cloned(),
        audit: None,
    }
}

fn tier_list(tiers: &std::collections::BTreeSet<Tier>) -> String {
    tiers.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", ")
}

impl Report {
    pub fn with_audit(mut self, audit: CatalogAudit) -> Self {
        self.issue_count += audit.issue_count();
        self.ok = self.issue_count == 0;
        self.audit = Some(audit);
        self
    }

    /// Consistent catalog and, for a fix run, no failed corrections.
    pub fn passed(&self) -> bool {
        self.ok && self.apply.as_ref().map_or(true, |a| a.errors.is_empty())
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        if self.ok && self.apply.is_none() {
            out.push_str(ALL_PASSED);
            self.render_audit_notes(&mut out);
            return out;
        }

        out.push_str("groups:\n");
        for (group, diff) in &self.groups {
            let _ = writeln!(
                out,
                "  {group}: {} missing, {} extra",
                diff.missing.len(),
                diff.extra.len()
            );
            if !diff.missing.is_empty() {
                let _ = writeln!(out, "    missing: {}", diff.missing.join(", "));
            }
            if !diff.extra.is_empty() {
                let _ = writeln!(out, "    extra: {}", diff.extra.join(", "));
            }
        }

        if !self.tiers.is_empty() {
            out.push_str("tiers:\n");
            for (class, found) in &self.tiers {
                let _ = writeln!(
                    out,
                    "  {class} (allowed: {}): {} violation(s)",
                    tier_list(&found.allowed_tiers),
                    found.violations.len()
                );
                for v in &found.violations {
                    let _ = writeln!(out, "    {}: {}", v.name, v.actual_tier);
                }
            }
        }

        if let Some(apply) = &self.apply {
            let _ = writeln!(
                out,
                "corrections{}: {} updated, {} skipped ({} not found, {} already correct), {} error(s)",
                if apply.dry_run { " (dry run)" } else { "" },
                apply.updated,
                apply.skipped,
                apply.skipped_for(SkipReason::NotFound),
                apply.skipped_for(SkipReason::AlreadyCorrect),
                apply.errors.len()
            );
            for err in &apply.errors {
                let partial = if err.groups_written {
                    " (groups already written)"
                } else {
                    ""
                };
                let _ = writeln!(out, "    {}: {}{partial}", err.name, err.reason);
            }
        }

        if let Some(audit) = &self.audit {
            if !audit.ungrouped.is_empty() {
                let _ = writeln!(out, "ungrouped: {}", audit.ungrouped.join(", "));
            }
            for legacy in &audit.legacy_tiers {
                let _ = writeln!(
                    out,
                    "legacy tier: {} stored as {} (reads as {})",
                    legacy.name, legacy.stored, legacy.reads_as
                );
            }
            for row in &audit.unreadable {
                let _ = writeln!(out, "unreadable: {} ({}): {}", row.name, row.id, row.reason);
            }
        }
        self.render_audit_notes(&mut out);

        if !out.ends_with('\n') {
            out.push('\n');
        }
        if self.passed() {
            out.push_str("result: ok");
        } else {
            let _ = write!(out, "result: FAILED ({} issue(s))", self.issue_count);
        }
        out
    }

    /// Informational audit lines; these never affect `ok`.
    fn render_audit_notes(&self, out: &mut String) {
        let Some(audit) = &self.audit else {
            return;
        };
        if !audit.missing_from_store.is_empty() {
            let _ = write!(out, "\nnot in store: {}", audit.missing_from_store.join(", "));
        }
        for hint in &audit.near_matches {
            let _ = write!(
                out,
                "\n  did you mean `{}` for `{}`? ({:.2})",
                hint.candidate, hint.expected, hint.score
            );
        }
    }

    pub fn render_markdown(&self, meta: &RunMeta) -> String {
        let mut md = String::new();
        let _ = writeln!(md, "# Catalog Reconciliation Report\n");
        let _ = writeln!(md, "- Run ID: `{}`", meta.run_id);
        let _ = writeln!(md, "- Mode: {}", meta.mode);
        let _ = writeln!(md, "- Started: {}", meta.started_at.to_rfc3339());
        let _ = writeln!(md, "- Finished: {}", meta.finished_at.to_rfc3339());
        let _ = writeln!(md, "- Store: {}", meta.store_backend);
        let _ = writeln!(md, "- Reference fingerprint: `{}`", meta.reference_fingerprint);
        if meta.substring_match {
            md.push_str("- Matching: substring (diagnostic)\n");
        }
        let _ = writeln!(
            md,
            "- Result: **{}** ({} issue(s))\n",
            if self.passed() { "passed" } else { "failed" },
            self.issue_count
        );

        md.push_str("## Groups\n\n| group | missing | extra |\n|---|---|---|\n");
        for (group, diff) in &self.groups {
            let _ = writeln!(
                md,
                "| {group} | {} | {} |",
                cell(&diff.missing),
                cell(&diff.extra)
            );
        }

        md.push_str("\n## Tier Violations\n\n");
        if self.tiers.is_empty() {
            md.push_str("_none_\n");
        }
        for (class, found) in &self.tiers {
            let _ = writeln!(md, "### {class} (allowed: {})\n", tier_list(&found.allowed_tiers));
            for v in &found.violations {
                let _ = writeln!(md, "- {}: {}", v.name, v.actual_tier);
            }
            md.push('\n');
        }

        if let Some(apply) = &self.apply {
            md.push_str("\n## Corrections\n\n| name | outcome |\n|---|---|\n");
            for outcome in &apply.outcomes {
                let _ = writeln!(md, "| {} | {} |", outcome.name(), outcome_label(outcome));
            }
        }

        if let Some(audit) = &self.audit {
            md.push_str("\n## Catalog Audit\n\n");
            let _ = writeln!(md, "- Not in store: {}", cell(&audit.missing_from_store));
            let _ = writeln!(md, "- Ungrouped records: {}", cell(&audit.ungrouped));
            for legacy in &audit.legacy_tiers {
                let _ = writeln!(
                    md,
                    "- Legacy tier: {} stored as `{}` (reads as {})",
                    legacy.name, legacy.stored, legacy.reads_as
                );
            }
            for row in &audit.unreadable {
                let _ = writeln!(md, "- Unreadable row `{}` ({}): {}", row.id, row.name, row.reason);
            }
            for hint in &audit.near_matches {
                let _ = writeln!(
                    md,
                    "- Possible spelling: `{}` for `{}` ({:.2})",
                    hint.candidate, hint.expected, hint.score
                );
            }
        }
        md
    }
}

fn cell(names: &[String]) -> String {
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(", ")
    }
}

fn outcome_label(outcome: &CorrectionOutcome) -> String {
    let changed = |groups: bool, tier: bool| match (groups, tier) {
        (true, true) => "groups, tier",
        (true, false) => "groups",
        (false, true) => "tier",
        (false, false) => "nothing",
    };
    match outcome {
        CorrectionOutcome::Updated {
            groups_changed,
            tier_changed,
            ..
        } => format!("updated ({})", changed(*groups_changed, *tier_changed)),
        CorrectionOutcome::WouldUpdate {
            groups_changed,
            tier_changed,
            ..
        } => format!("would update ({})", changed(*groups_changed, *tier_changed)),
        CorrectionOutcome::Skipped { reason, .. } => format!("skipped: {}", reason.as_str()),
        CorrectionOutcome::Failed {
            reason,
            groups_written: true,
            ..
        } => format!("error: {reason} (groups already written)"),
        CorrectionOutcome::Failed { reason, .. } => format!("error: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClassViolations, CorrectionError, GroupDiff, NearMatch, TierViolation};

    fn drifted() -> (GroupResult, TierResult) {
        let groups = GroupResult::from([
            (
                "core".to_string(),
                GroupDiff {
                    missing: vec!["Adam Beyer".into()],
                    extra: vec![],
                },
            ),
            ("asot".to_string(), GroupDiff::default()),
        ]);
        let tiers = TierResult::from([(
            "headliner".to_string(),
            ClassViolations {
                allowed_tiers: [Tier::Epic, Tier::Legendary].into_iter().collect(),
                violations: vec![TierViolation {
                    name: "Carl Cox".into(),
                    actual_tier: Tier::Common,
                }],
            },
        )]);
        (groups, tiers)
    }

    #[test]
    fn empty_inputs_render_single_line() {
        let report = format_report(&GroupResult::new(), &TierResult::new(), None);
        assert!(report.ok);
        assert_eq!(report.issue_count, 0);
        assert_eq!(report.render_text(), ALL_PASSED);
    }

    #[test]
    fn clean_groups_still_pass() {
        let groups = GroupResult::from([("core".to_string(), GroupDiff::default())]);
        let report = format_report(&groups, &TierResult::new(), None);
        assert_eq!(report.render_text(), ALL_PASSED);
    }

    #[test]
    fn drift_is_listed_with_counts() {
        let (groups, tiers) = drifted();
        let report = format_report(&groups, &tiers, None);
        assert!(!report.ok);
        assert_eq!(report.issue_count, 2);

        let text = report.render_text();
        assert!(text.contains("core: 1 missing, 0 extra"));
        assert!(text.contains("missing: Adam Beyer"));
        assert!(text.contains("headliner (allowed: EPIC, LEGENDARY): 1 violation(s)"));
        assert!(text.contains("Carl Cox: COMMON"));
        assert!(text.ends_with("result: FAILED (2 issue(s))"));
    }

    #[test]
    fn apply_errors_fail_an_otherwise_clean_report() {
        let apply = ApplySummary {
            updated: 1,
            errors: vec![CorrectionError {
                name: "Hardwell".into(),
                reason: "write rejected: timeout".into(),
                groups_written: false,
            }],
            ..Default::default()
        };
        let report = format_report(&GroupResult::new(), &TierResult::new(), Some(&apply));
        assert!(report.ok);
        assert!(!report.passed());
        let text = report.render_text();
        assert!(text.contains("1 updated, 0 skipped"));
        assert!(text.contains("Hardwell: write rejected: timeout"));
    }

    #[test]
    fn partial_write_is_called_out() {
        let outcome = CorrectionOutcome::Failed {
            name: "Carl Cox".into(),
            reason: "write rejected: boom".into(),
            groups_written: true,
        };
        let apply = ApplySummary {
            errors: vec![CorrectionError {
                name: "Carl Cox".into(),
                reason: "write rejected: boom".into(),
                groups_written: true,
            }],
            outcomes: vec![outcome.clone()],
            ..Default::default()
        };
        let report = format_report(&GroupResult::new(), &TierResult::new(), Some(&apply));
        assert!(report
            .render_text()
            .contains("Carl Cox: write rejected: boom (groups already written)"));
        assert_eq!(
            outcome_label(&outcome),
            "error: write rejected: boom (groups already written)"
        );
    }

    #[test]
    fn legacy_and_unreadable_rows_fail_the_report() {
        let report = format_report(&GroupResult::new(), &TierResult::new(), None).with_audit(
            CatalogAudit {
                legacy_tiers: vec![crate::LegacyTier {
                    name: "Maddix".into(),
                    stored: "UNCOMMON".into(),
                    reads_as: Tier::Rare,
                }],
                unreadable: vec![djcat_storage::RejectedRow {
                    id: djcat_core::RecordId::new_v4(),
                    name: "Zedd".into(),
                    reason: "unknown tier `MYTHIC`".into(),
                }],
                ..Default::default()
            },
        );
        assert!(!report.ok);
        assert_eq!(report.issue_count, 2);
        let text = report.render_text();
        assert!(text.contains("legacy tier: Maddix stored as UNCOMMON (reads as RARE)"));
        assert!(text.contains("unreadable: Zedd"));
    }

    #[test]
    fn ungrouped_records_count_against_ok() {
        let report = format_report(&GroupResult::new(), &TierResult::new(), None).with_audit(
            CatalogAudit {
                ungrouped: vec!["Zatox".into()],
                ..Default::default()
            },
        );
        assert!(!report.ok);
        assert_eq!(report.issue_count, 1);
        assert!(report.render_text().contains("ungrouped: Zatox"));
    }

    #[test]
    fn near_match_hints_are_informational() {
        let report = format_report(&GroupResult::new(), &TierResult::new(), None).with_audit(
            CatalogAudit {
                missing_from_store: vec!["Fred again..".into()],
                ungrouped: vec![],
                near_matches: vec![NearMatch {
                    expected: "Fred again..".into(),
                    candidate: "Fred Again".into(),
                    score: 0.97,
                }],
                ..Default::default()
            },
        );
        assert!(report.passed());
        let text = report.render_text();
        assert!(text.starts_with(ALL_PASSED));
        assert!(text.contains("did you mean `Fred Again` for `Fred again..`?"));
    }

    #[test]
    fn markdown_carries_run_metadata() {
        let (groups, tiers) = drifted();
        let meta = RunMeta {
            run_id: Uuid::nil(),
            mode: "verify".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            store_backend: "memory".into(),
            reference_fingerprint: "abc123".into(),
            substring_match: false,
        };
        let md = format_report(&groups, &tiers, None).render_markdown(&meta);
        assert!(md.starts_with("# Catalog Reconciliation Report"));
        assert!(md.contains("`00000000-0000-0000-0000-000000000000`"));
        assert!(md.contains("| core | Adam Beyer | - |"));
        assert!(md.contains("- Carl Cox: COMMON"));
        assert!(md.contains("**failed**"));
    }
}
