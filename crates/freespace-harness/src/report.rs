//! Report generation for harness runs.

use freespace_core::SpaceConfig;
use serde::Serialize;

use crate::epoch::EpochReport;
use crate::storm::StormReport;

/// Everything one harness invocation produced.
#[derive(Debug, Clone, Serialize)]
pub struct HarnessReport {
    pub title: String,
    /// Timestamp (UTC).
    pub timestamp: String,
    pub space_config: SpaceConfig,
    pub storms: Vec<StormReport>,
    pub epochs: Option<EpochReport>,
}

impl HarnessReport {
    #[must_use]
    pub fn new(title: impl Into<String>, space_config: SpaceConfig) -> Self {
        Self {
            title: title.into(),
            timestamp: format!("{:?}", std::time::SystemTime::now()),
            space_config,
            storms: Vec::new(),
            epochs: None,
        }
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.storms.iter().all(|s| s.integrity_check_passed)
            && self
                .epochs
                .as_ref()
                .is_none_or(|e| e.disjoint && e.integrity_check_passed)
    }

    /// Render the report as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.title));
        out.push_str(&format!("- Timestamp: {}\n", self.timestamp));
        out.push_str(&format!("- Locking: {:?}\n", self.space_config.locking));
        out.push_str(&format!("- Passed: {}\n\n", self.all_passed()));

        if !self.storms.is_empty() {
            out.push_str("| Storm | Ops | Peak live | Failures | Merges | Max frag | Status |\n");
            out.push_str("|-------|-----|-----------|----------|--------|----------|--------|\n");
            for s in &self.storms {
                let status = if s.integrity_check_passed { "PASS" } else { "FAIL" };
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {} | {:.4} | {} |\n",
                    s.kind.as_str(),
                    s.ops,
                    s.peak_live_words,
                    s.allocation_failures,
                    s.sweeper_merges,
                    s.max_fragmentation,
                    status
                ));
            }
            out.push('\n');
        }

        if let Some(e) = &self.epochs {
            out.push_str("| Epoch | Blocks | Words | Refills | Free after |\n");
            out.push_str("|-------|--------|-------|---------|------------|\n");
            for epoch in &e.epochs {
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {} |\n",
                    epoch.epoch, epoch.blocks, epoch.words, epoch.plab_refills, epoch.free_words_after
                ));
            }
        }
        out
    }

    /// Render the report as JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storm::{StormConfig, StormKind, run_storm};

    fn with_one_storm() -> HarnessReport {
        let config = SpaceConfig::default();
        let mut report = HarnessReport::new("storms", config.clone());
        let storm = StormConfig {
            kind: StormKind::Sawtooth,
            ops: 1_000,
            ..StormConfig::default()
        };
        report.storms.push(run_storm(&config, &storm).unwrap());
        report
    }

    #[test]
    fn markdown_lists_each_storm() {
        let report = with_one_storm();
        let md = report.to_markdown();
        assert!(md.starts_with("# storms\n"));
        assert!(md.contains("| sawtooth |"));
        assert!(md.contains("PASS"));
        assert!(report.all_passed());
    }

    #[test]
    fn json_carries_config_and_storms() {
        let report = with_one_storm();
        let json: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(json["title"], "storms");
        assert_eq!(json["space_config"]["index_set_size"], 257);
        assert_eq!(json["storms"][0]["kind"], "sawtooth");
        assert!(json["epochs"].is_null());
    }
}
