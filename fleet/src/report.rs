//! Rendering of fan-out results for the command line

use std::collections::BTreeMap;

use common::{HostResults, OperationResult, SyncCounters};

/// Outcome of one command line invocation across all hosts
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct Summary {
    pub hosts: usize,
    pub succeeded: usize,
    /// hostnames, sorted
    pub failed: Vec<String>,
    /// totals over all hosts for tree syncs
    pub sync: Option<SyncCounters>,
}

impl Summary {
    pub fn from_results(results: &HostResults) -> Self {
        let mut failed: Vec<String> = results
            .iter()
            .filter(|(_, result)| !result.success)
            .map(|(host, _)| host.clone())
            .collect();
        failed.sort();
        Self {
            hosts: results.len(),
            succeeded: results.len() - failed.len(),
            failed,
            sync: results
                .values()
                .filter_map(|result| result.sync)
                .reduce(|total, counters| total + counters),
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "hosts: {}\nsucceeded: {}\nfailed: {}",
            self.hosts,
            self.succeeded,
            self.failed.len()
        )?;
        if !self.failed.is_empty() {
            write!(f, " ({})", self.failed.join(", "))?;
        }
        if let Some(sync) = &self.sync {
            write!(f, "\n{}", sync)?;
        }
        Ok(())
    }
}

fn sorted(results: &HostResults) -> BTreeMap<&str, &OperationResult> {
    results
        .iter()
        .map(|(host, result)| (host.as_str(), result))
        .collect()
}

/// One status line per host followed by its output, each output line prefixed by the host
pub fn render_text(results: &HostResults) -> String {
    let mut text = String::new();
    for (host, result) in sorted(results) {
        text.push_str(&format!("[{}] {}\n", host, result.short()));
        for line in result.stdout.lines() {
            text.push_str(&format!("{}: {}\n", host, line));
        }
    }
    text
}

/// Remote stderr of every host, prefixed like [`render_text`]
pub fn render_stderr(results: &HostResults) -> String {
    let mut text = String::new();
    for (host, result) in sorted(results) {
        for line in result.stderr.lines() {
            text.push_str(&format!("{}: {}\n", host, line));
        }
    }
    text
}

/// Results as a JSON object keyed by host, in host order
pub fn render_json(results: &HostResults) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(&sorted(results))?)
}
