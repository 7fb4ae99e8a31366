use serde::Serialize;
use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Idle,
    LoadingSource,
    LoadingDestination,
    ResolvingConflicts,
    MigratingMods,
    MigratingTools,
    MigratingConfig,
    Completed,
    CompletedWithErrors,
    Aborted,
}

impl MigrationState {
    fn index(self) -> usize {
        match self {
            MigrationState::Idle => 0,
            MigrationState::LoadingSource => 1,
            MigrationState::LoadingDestination => 2,
            MigrationState::ResolvingConflicts => 3,
            MigrationState::MigratingMods => 4,
            MigrationState::MigratingTools => 5,
            MigrationState::MigratingConfig => 6,
            MigrationState::Completed
            | MigrationState::CompletedWithErrors
            | MigrationState::Aborted => 7,
        }
    }

    const STAGE_COUNT: usize = 7;

    pub fn label(self) -> &'static str {
        match self {
            MigrationState::Idle => "Idle",
            MigrationState::LoadingSource => "Loading source instance",
            MigrationState::LoadingDestination => "Loading destination instance",
            MigrationState::ResolvingConflicts => "Resolving file conflicts",
            MigrationState::MigratingMods => "Migrating mods",
            MigrationState::MigratingTools => "Migrating tools",
            MigrationState::MigratingConfig => "Migrating configuration",
            MigrationState::Completed => "Completed",
            MigrationState::CompletedWithErrors => "Completed with errors",
            MigrationState::Aborted => "Aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MigrationState::Completed
                | MigrationState::CompletedWithErrors
                | MigrationState::Aborted
        )
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone)]
pub struct MigrationProgress {
    pub state: MigrationState,
    pub current: usize,
    pub total: usize,
    pub overall_progress: f32,
    pub detail: Option<String>,
}

pub type ProgressCallback = Arc<dyn Fn(MigrationProgress) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
}

impl ProgressReporter {
    pub fn new(callback: Option<ProgressCallback>) -> Self {
        Self { callback }
    }

    pub fn report(&self, state: MigrationState, current: usize, total: usize, detail: Option<String>) {
        let Some(callback) = &self.callback else {
            return;
        };
        let overall_progress = if state.is_terminal() {
            1.0
        } else {
            let total = total.max(1);
            let fraction = (current.min(total) as f32) / (total as f32);
            let stage = state.index().saturating_sub(1) as f32;
            (stage + fraction) / MigrationState::STAGE_COUNT as f32
        };
        callback(MigrationProgress {
            state,
            current,
            total,
            overall_progress: overall_progress.clamp(0.0, 1.0),
            detail,
        });
    }

    pub fn enter(&self, state: MigrationState) {
        self.report(state, 0, 0, None);
    }
}

pub struct FileCounter<'a> {
    reporter: &'a ProgressReporter,
    done: AtomicUsize,
    total: usize,
    every: usize,
}

impl<'a> FileCounter<'a> {
    pub fn new(reporter: &'a ProgressReporter, total: usize) -> Self {
        Self {
            reporter,
            done: AtomicUsize::new(0),
            total,
            every: (total / 200).clamp(1, 500),
        }
    }

    pub fn bump(&self, detail: impl FnOnce() -> String) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        if done % self.every == 0 || done == self.total {
            self.reporter
                .report(MigrationState::MigratingMods, done, self.total, Some(detail()));
        }
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::Relaxed)
    }
}
