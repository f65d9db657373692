//! Report artifacts: Markdown and JSON renderings of the shortlist.
//!
//! Both artifacts carry the same data; the schemas are stable so
//! downstream review tooling can rely on them. Filenames are
//! timestamped, one pair per run.

use std::path::{Path, PathBuf};

use crate::error::{MinerError, Result};
use crate::types::{ShortlistConfig, ShortlistReport};

/// Render the human-readable Markdown report.
pub fn render_markdown(report: &ShortlistReport) -> String {
    let mut out = String::new();
    out.push_str("# Decision Shortlist\n\n");
    out.push_str(&format!(
        "Generated: {}\n\nOpportunities considered: {} | passed hard filters: {}\n\n",
        report.generated_at.format("%Y-%m-%d %H:%M UTC"),
        report.considered,
        report.passed_filters
    ));

    if report.entries.is_empty() {
        out.push_str("## No candidates\n\n");
        out.push_str(
            "Fewer than three opportunities survived the hard filters, so no \
             shortlist was produced.\n\n",
        );
        match &report.binding_filter {
            Some(filter) => out.push_str(&format!(
                "The most restrictive filter was **{}**; relaxing it would grow \
                 the candidate pool fastest.\n",
                filter
            )),
            None => out.push_str("No opportunities were available to filter.\n"),
        }
        return out;
    }

    for (rank, entry) in report.entries.iter().enumerate() {
        out.push_str(&format!(
            "## {}. {} (score {:.2})\n\n",
            rank + 1,
            entry.name,
            entry.final_score
        ));
        out.push_str(&format!("**Problem**: {}\n\n", entry.problem));
        out.push_str(&format!("**MVP**: {}\n\n", entry.mvp));
        out.push_str(&format!("**Why now**: {}\n\n", entry.why_now));
        out.push_str(&format!(
            "Viability {:.1} | cluster {} | trust {:.2} | cross-source boost {:.1}\n\n",
            entry.viability_score, entry.cluster_size, entry.trust_level, entry.cross_source_boost
        ));
    }
    out
}

/// Render the machine-readable JSON report.
pub fn render_json(report: &ShortlistReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

/// Write both artifacts with timestamped filenames.
///
/// Returns the Markdown and JSON paths.
pub fn write_report(
    report: &ShortlistReport,
    config: &ShortlistConfig,
) -> Result<(PathBuf, PathBuf)> {
    let stamp = report.generated_at.format("%Y%m%d_%H%M%S");

    let markdown_path = Path::new(&config.markdown_dir).join(format!("shortlist_{}.md", stamp));
    let json_path = Path::new(&config.json_dir).join(format!("shortlist_{}.json", stamp));

    for dir in [&config.markdown_dir, &config.json_dir] {
        std::fs::create_dir_all(dir).map_err(MinerError::storage)?;
    }
    std::fs::write(&markdown_path, render_markdown(report)).map_err(MinerError::storage)?;
    std::fs::write(&json_path, render_json(report)?).map_err(MinerError::storage)?;

    Ok((markdown_path, json_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShortlistEntry;

    fn entry(name: &str, score: f32) -> ShortlistEntry {
        ShortlistEntry {
            cluster_id: "reddit_00".into(),
            name: name.into(),
            viability_score: 7.5,
            cluster_size: 8,
            trust_level: 0.8,
            cross_source_boost: 0.5,
            final_score: score,
            problem: "Users in excel struggle with exports because they crash".into(),
            mvp: "A minimal tool that resumes exports".into(),
            why_now: "Complaints keep recurring".into(),
        }
    }

    fn report(entries: Vec<ShortlistEntry>, binding: Option<&str>) -> ShortlistReport {
        ShortlistReport {
            entries,
            considered: 10,
            passed_filters: 4,
            binding_filter: binding.map(str::to_string),
            generated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn markdown_lists_ranked_entries() {
        let rendered = render_markdown(&report(
            vec![entry("Export Sentry", 9.1), entry("Sync Guard", 8.2)],
            None,
        ));
        assert!(rendered.contains("## 1. Export Sentry (score 9.10)"));
        assert!(rendered.contains("## 2. Sync Guard (score 8.20)"));
        assert!(rendered.contains("**Problem**:"));
    }

    #[test]
    fn empty_report_names_the_binding_filter() {
        let rendered = render_markdown(&report(vec![], Some("viability")));
        assert!(rendered.contains("No candidates"));
        assert!(rendered.contains("**viability**"));
    }

    #[test]
    fn json_round_trips() {
        let rendered = render_json(&report(vec![entry("Export Sentry", 9.1)], None)).unwrap();
        let parsed: ShortlistReport = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].name, "Export Sentry");
    }
}
