use crate::{error::format_bytes, instance::FileScope};
use parking_lot::Mutex;
use serde::Serialize;
use std::{fmt, path::PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepError {
    pub step: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    SingleFileConflicts { count: usize },
    PurgeDeployment { staging: PathBuf },
    RootBuilderRequired { files: usize },
    UnmanagedMods { names: Vec<String> },
    InstallManager { path: PathBuf },
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::SingleFileConflicts { count } => write!(
                f,
                "{count} file(s) differ between mods under the same path; only the winning copy was migrated"
            ),
            Advisory::PurgeDeployment { staging } => write!(
                f,
                "Vortex still has a deployment for {}; deploy again from Vortex to pick up the migrated mods",
                staging.display()
            ),
            Advisory::RootBuilderRequired { files } => write!(
                f,
                "{files} file(s) were placed in Root folders; install the Root Builder plugin for MO2 to deploy them"
            ),
            Advisory::UnmanagedMods { names } => write!(
                f,
                "mod folders missing from the load order were added disabled: {}",
                names.join(", ")
            ),
            Advisory::InstallManager { path } => write!(
                f,
                "Mod Organizer 2 is not installed in {}; install it before using the instance",
                path.display()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SingleFileConflict {
    pub relative_path: PathBuf,
    pub scope: FileScope,
    pub winner: String,
    pub losers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub linked: usize,
    pub copied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes_copied: u64,
}

impl TransferStats {
    pub fn merge(&mut self, other: &TransferStats) {
        self.linked += other.linked;
        self.copied += other.copied;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.bytes_copied += other.bytes_copied;
    }

    pub fn files(&self) -> usize {
        self.linked + self.copied + self.skipped + self.failed
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    failed_mods: Vec<FailedItem>,
    failed_tools: Vec<FailedItem>,
    other_errors: Vec<StepError>,
    advisories: Vec<Advisory>,
    conflicts: Vec<SingleFileConflict>,
    stats: TransferStats,
    migrated_mods: usize,
    migrated_tools: usize,
}

impl MigrationReport {
    pub fn failed_mods(&self) -> &[FailedItem] {
        &self.failed_mods
    }

    pub fn failed_tools(&self) -> &[FailedItem] {
        &self.failed_tools
    }

    pub fn other_errors(&self) -> &[StepError] {
        &self.other_errors
    }

    pub fn advisories(&self) -> &[Advisory] {
        &self.advisories
    }

    pub fn conflicts(&self) -> &[SingleFileConflict] {
        &self.conflicts
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    pub fn migrated_mods(&self) -> usize {
        self.migrated_mods
    }

    pub fn migrated_tools(&self) -> usize {
        self.migrated_tools
    }

    pub fn has_errors(&self) -> bool {
        !self.failed_mods.is_empty()
            || !self.failed_tools.is_empty()
            || !self.other_errors.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} mod(s) and {} tool(s) migrated; {} linked, {} copied ({}), {} skipped; {} mod(s), {} tool(s) and {} step(s) failed",
            self.migrated_mods,
            self.migrated_tools,
            self.stats.linked,
            self.stats.copied,
            format_bytes(self.stats.bytes_copied),
            self.stats.skipped,
            self.failed_mods.len(),
            self.failed_tools.len(),
            self.other_errors.len()
        )
    }
}

#[derive(Debug, Default)]
pub struct ReportCollector {
    inner: Mutex<MigrationReport>,
}

impl ReportCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_mod(&self, id: &str, reason: impl Into<String>) {
        let mut report = self.inner.lock();
        if report.failed_mods.iter().any(|item| item.id == id) {
            return;
        }
        report.failed_mods.push(FailedItem {
            id: id.to_string(),
            reason: reason.into(),
        });
    }

    pub fn fail_tool(&self, name: &str, reason: impl Into<String>) {
        self.inner.lock().failed_tools.push(FailedItem {
            id: name.to_string(),
            reason: reason.into(),
        });
    }

    pub fn step_failed(&self, step: &str, reason: impl Into<String>) {
        self.inner.lock().other_errors.push(StepError {
            step: step.to_string(),
            reason: reason.into(),
        });
    }

    pub fn advise(&self, advisory: Advisory) {
        let mut report = self.inner.lock();
        if !report.advisories.contains(&advisory) {
            report.advisories.push(advisory);
        }
    }

    pub fn add_conflicts(&self, conflicts: Vec<SingleFileConflict>) {
        self.inner.lock().conflicts.extend(conflicts);
    }

    pub fn add_stats(&self, stats: &TransferStats) {
        self.inner.lock().stats.merge(stats);
    }

    pub fn mod_migrated(&self) {
        self.inner.lock().migrated_mods += 1;
    }

    pub fn tool_migrated(&self) {
        self.inner.lock().migrated_tools += 1;
    }

    pub fn is_mod_failed(&self, id: &str) -> bool {
        self.inner.lock().failed_mods.iter().any(|item| item.id == id)
    }

    pub fn finish(self) -> MigrationReport {
        let mut report = self.inner.into_inner();
        report.failed_mods.sort_by(|a, b| a.id.cmp(&b.id));
        report
    }
}
