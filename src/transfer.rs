use crate::{
    error::{MigrationError, MigrationResult},
    paths,
    progress::{FileCounter, ProgressReporter},
    report::{ReportCollector, TransferStats},
};
use anyhow::{anyhow, Context, Result};
use filetime::{set_file_mtime, FileTime};
use rayon::prelude::*;
#[cfg(unix)]
use std::os::unix::fs::MetadataExt;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::UNIX_EPOCH,
};
use sysinfo::Disks;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub use_hardlinks: bool,
    pub replace_existing: bool,
    pub worker_threads: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            use_hardlinks: true,
            replace_existing: false,
            worker_threads: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    Hardlink,
    Copy,
}

impl TransferMode {
    pub fn label(self) -> &'static str {
        match self {
            TransferMode::Hardlink => "hardlink",
            TransferMode::Copy => "copy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Linked,
    Copied(u64),
    Skipped,
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Free bytes left after the preflight. Hardlinks that fall back to a copy
/// draw from it, so an unplanned copy cannot fill the volume.
#[derive(Debug)]
pub struct CopyBudget(AtomicU64);

impl CopyBudget {
    pub fn new(bytes: u64) -> Self {
        Self(AtomicU64::new(bytes))
    }

    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }

    pub fn take(&self, bytes: u64) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(bytes))
            .is_ok()
    }

    pub fn remaining(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct FilePlan {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub size: u64,
    pub mode: TransferMode,
}

#[derive(Debug, Clone)]
pub struct TransferJob {
    pub mod_id: String,
    pub files: Vec<FilePlan>,
}

#[cfg(unix)]
pub fn filesystem_id(path: &Path) -> Result<u64> {
    let existing = paths::existing_ancestor(path)
        .with_context(|| format!("no existing ancestor for {:?}", path))?;
    Ok(fs::metadata(&existing)
        .with_context(|| format!("stat {:?}", existing))?
        .dev())
}

#[cfg(not(unix))]
pub fn filesystem_id(path: &Path) -> Result<u64> {
    let _ = path;
    Ok(0)
}

pub fn same_volume(a: &Path, b: &Path) -> bool {
    match (filesystem_id(a), filesystem_id(b)) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}

pub struct ModeCache {
    use_hardlinks: bool,
    modes: HashMap<(PathBuf, PathBuf), TransferMode>,
}

impl ModeCache {
    pub fn new(use_hardlinks: bool) -> Self {
        Self {
            use_hardlinks,
            modes: HashMap::new(),
        }
    }

    pub fn mode_for(&mut self, source_root: &Path, dest_root: &Path) -> TransferMode {
        if !self.use_hardlinks {
            return TransferMode::Copy;
        }
        let key = (source_root.to_path_buf(), dest_root.to_path_buf());
        if let Some(mode) = self.modes.get(&key) {
            return *mode;
        }
        let mode = if same_volume(source_root, dest_root) {
            TransferMode::Hardlink
        } else {
            TransferMode::Copy
        };
        self.modes.insert(key, mode);
        mode
    }
}

pub fn transfer_file(
    source: &Path,
    dest: &Path,
    mode: TransferMode,
    replace: bool,
    budget: &CopyBudget,
) -> Result<TransferOutcome> {
    if let Ok(meta) = fs::symlink_metadata(dest) {
        if meta.file_type().is_dir() {
            return Err(anyhow!("destination exists as directory: {:?}", dest));
        }
        if !replace {
            return Ok(TransferOutcome::Skipped);
        }
        fs::remove_file(dest).with_context(|| format!("remove existing file {:?}", dest))?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {:?}", parent))?;
    }
    if mode == TransferMode::Hardlink {
        return match fs::hard_link(source, dest) {
            Ok(()) => Ok(TransferOutcome::Linked),
            Err(err) => {
                debug!("hardlink {:?} -> {:?} failed ({err}), copying", source, dest);
                fallback_copy(source, dest, budget)
            }
        };
    }
    copy_file(source, dest)
}

fn fallback_copy(source: &Path, dest: &Path, budget: &CopyBudget) -> Result<TransferOutcome> {
    let size = fs::metadata(source)
        .with_context(|| format!("stat {:?}", source))?
        .len();
    if !budget.take(size) {
        return Err(anyhow!(
            "hardlink to {:?} failed and no space was reserved for a copy ({} left)",
            dest,
            crate::error::format_bytes(budget.remaining())
        ));
    }
    copy_file(source, dest)
}

fn copy_file(source: &Path, dest: &Path) -> Result<TransferOutcome> {
    let copied = fs::copy(source, dest).with_context(|| format!("copy {:?} -> {:?}", source, dest))?;
    preserve_mtime(source, dest);
    Ok(TransferOutcome::Copied(copied))
}

fn preserve_mtime(source: &Path, dest: &Path) {
    let Ok(meta) = fs::metadata(source) else {
        return;
    };
    let Ok(modified) = meta.modified() else {
        return;
    };
    let Ok(duration) = modified.duration_since(UNIX_EPOCH) else {
        return;
    };
    let mtime = FileTime::from_unix_time(duration.as_secs() as i64, duration.subsec_nanos());
    let _ = set_file_mtime(dest, mtime);
}

pub trait SpaceProbe: Send + Sync {
    fn available_space(&self, path: &Path) -> Result<(u64, PathBuf)>;
}

pub struct SystemSpaceProbe;

impl SpaceProbe for SystemSpaceProbe {
    fn available_space(&self, path: &Path) -> Result<(u64, PathBuf)> {
        let existing = paths::existing_ancestor(path)
            .with_context(|| format!("no existing ancestor for {:?}", path))?;
        let target = existing.canonicalize().unwrap_or(existing);
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .with_context(|| format!("no mounted volume contains {:?}", target))?;
        Ok((disk.available_space(), disk.mount_point().to_path_buf()))
    }
}

pub struct FixedSpaceProbe(pub u64);

impl SpaceProbe for FixedSpaceProbe {
    fn available_space(&self, path: &Path) -> Result<(u64, PathBuf)> {
        Ok((self.0, path.to_path_buf()))
    }
}

pub fn check_same_location(source: &Path, dest: &Path) -> MigrationResult<()> {
    if paths::same_location(source, dest) {
        return Err(MigrationError::SourceEqualsDestination(
            paths::resolve_location(dest),
        ));
    }
    Ok(())
}

pub fn check_space(required: u64, dest: &Path, probe: &dyn SpaceProbe) -> MigrationResult<u64> {
    let (available, volume) =
        probe
            .available_space(dest)
            .map_err(|err| MigrationError::FreeSpaceUnknown {
                path: dest.to_path_buf(),
                reason: format!("{err:#}"),
            })?;
    info!(required, available, volume = %volume.display(), "disk space preflight");
    if required > available {
        return Err(MigrationError::InsufficientSpace {
            required,
            available,
            volume,
        });
    }
    Ok(available)
}

/// Runs the jobs on a bounded pool. A failing file marks its job's mod as
/// failed and the pool moves on; only cancellation ends the run early.
pub fn run_jobs(
    jobs: &[TransferJob],
    options: &TransferOptions,
    cancel: &CancelToken,
    budget: &CopyBudget,
    report: &ReportCollector,
    progress: &ProgressReporter,
) -> MigrationResult<TransferStats> {
    let total_files = jobs.iter().map(|job| job.files.len()).sum();
    let counter = FileCounter::new(progress, total_files);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.worker_threads.max(1))
        .thread_name(|index| format!("transfer-{index}"))
        .build();

    let run = |job: &TransferJob| run_job(job, options, cancel, budget, report, &counter);
    let totals: Vec<TransferStats> = match pool {
        Ok(pool) => pool.install(|| jobs.par_iter().map(run).collect()),
        Err(err) => {
            warn!("transfer pool unavailable ({err}), running on the current thread");
            jobs.iter().map(run).collect()
        }
    };

    let mut stats = TransferStats::default();
    for job_stats in &totals {
        stats.merge(job_stats);
    }
    report.add_stats(&stats);

    if cancel.is_cancelled() {
        warn!("transfer cancelled after {} file(s)", counter.done());
        return Err(MigrationError::Cancelled);
    }
    Ok(stats)
}

fn run_job(
    job: &TransferJob,
    options: &TransferOptions,
    cancel: &CancelToken,
    budget: &CopyBudget,
    report: &ReportCollector,
    counter: &FileCounter<'_>,
) -> TransferStats {
    let mut stats = TransferStats::default();
    let mut first_error: Option<String> = None;
    for file in &job.files {
        if cancel.is_cancelled() {
            break;
        }
        match transfer_file(
            &file.source,
            &file.dest,
            file.mode,
            options.replace_existing,
            budget,
        ) {
            Ok(TransferOutcome::Linked) => stats.linked += 1,
            Ok(TransferOutcome::Copied(bytes)) => {
                stats.copied += 1;
                stats.bytes_copied += bytes;
            }
            Ok(TransferOutcome::Skipped) => stats.skipped += 1,
            Err(err) => {
                warn!(mod_id = %job.mod_id, "file transfer failed: {err:#}");
                stats.failed += 1;
                if first_error.is_none() {
                    first_error = Some(format!("{err:#}"));
                }
            }
        }
        counter.bump(|| job.mod_id.clone());
    }
    if let Some(reason) = first_error {
        let reason = if stats.failed > 1 {
            format!("{reason} (and {} more file(s))", stats.failed - 1)
        } else {
            reason
        };
        report.fail_mod(&job.mod_id, reason);
    }
    stats
}

pub fn sanitize_mod_name(name: &str, limit: usize) -> String {
    const ILLEGAL: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let cleaned: String = name
        .chars()
        .filter(|ch| !ILLEGAL.contains(ch) && !ch.is_control())
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.').trim();
    let mut truncated: String = cleaned.chars().take(limit.max(1)).collect();
    if truncated.chars().count() < cleaned.chars().count() {
        truncated = truncated
            .trim_end_matches(|ch: char| ch.is_whitespace() || "-_.".contains(ch))
            .to_string();
    }
    if truncated.is_empty() {
        return "Unnamed Mod".to_string();
    }
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_file_is_kept_without_replace() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.txt");
        let dst = tmp.path().join("out/dst.txt");
        fs::write(&src, "new").unwrap();
        fs::create_dir_all(dst.parent().unwrap()).unwrap();
        fs::write(&dst, "old").unwrap();
        let budget = CopyBudget::unlimited();

        let outcome = transfer_file(&src, &dst, TransferMode::Copy, false, &budget).unwrap();
        assert_eq!(outcome, TransferOutcome::Skipped);
        assert_eq!(fs::read_to_string(&dst).unwrap(), "old");

        let outcome = transfer_file(&src, &dst, TransferMode::Copy, true, &budget).unwrap();
        assert_eq!(outcome, TransferOutcome::Copied(3));
        assert_eq!(fs::read_to_string(&dst).unwrap(), "new");
    }

    #[test]
    fn directory_in_the_way_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.txt");
        let dst = tmp.path().join("dst");
        fs::write(&src, "x").unwrap();
        fs::create_dir_all(&dst).unwrap();
        let budget = CopyBudget::unlimited();
        assert!(transfer_file(&src, &dst, TransferMode::Copy, true, &budget).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn hardlink_shares_the_inode() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.txt");
        let dst = tmp.path().join("a/b/dst.txt");
        fs::write(&src, "linked").unwrap();
        let budget = CopyBudget::unlimited();

        let outcome = transfer_file(&src, &dst, TransferMode::Hardlink, false, &budget).unwrap();
        assert_eq!(outcome, TransferOutcome::Linked);
        let left = fs::metadata(&src).unwrap();
        let right = fs::metadata(&dst).unwrap();
        assert_eq!(left.ino(), right.ino());
    }

    #[test]
    fn mode_cache_copies_when_links_are_off() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cache = ModeCache::new(false);
        assert_eq!(cache.mode_for(tmp.path(), tmp.path()), TransferMode::Copy);
        let mut cache = ModeCache::new(true);
        assert_eq!(
            cache.mode_for(tmp.path(), &tmp.path().join("not-yet")),
            TransferMode::Hardlink
        );
    }

    #[test]
    fn space_check_reports_both_numbers() {
        let tmp = tempfile::tempdir().unwrap();
        let err = check_space(2048, tmp.path(), &FixedSpaceProbe(1024)).unwrap_err();
        match err {
            MigrationError::InsufficientSpace {
                required,
                available,
                ..
            } => {
                assert_eq!(required, 2048);
                assert_eq!(available, 1024);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(check_space(10, tmp.path(), &FixedSpaceProbe(1024)).unwrap(), 1024);
    }

    struct NoVolume;

    impl SpaceProbe for NoVolume {
        fn available_space(&self, path: &Path) -> Result<(u64, PathBuf)> {
            Err(anyhow!("no mounted volume contains {:?}", path))
        }
    }

    #[test]
    fn unknown_free_space_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let err = check_space(1, tmp.path(), &NoVolume).unwrap_err();
        assert!(matches!(err, MigrationError::FreeSpaceUnknown { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn copy_budget_never_goes_negative() {
        let budget = CopyBudget::new(10);
        assert!(budget.take(4));
        assert!(budget.take(6));
        assert!(!budget.take(1));
        assert_eq!(budget.remaining(), 0);
        assert!(budget.take(0));
    }

    #[test]
    fn fallback_copy_needs_reserved_space() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("big.bsa");
        let dst = tmp.path().join("out/big.bsa");
        fs::write(&src, "0123456789").unwrap();
        fs::create_dir_all(dst.parent().unwrap()).unwrap();

        let err = fallback_copy(&src, &dst, &CopyBudget::new(9)).unwrap_err();
        assert!(format!("{err:#}").contains("no space was reserved"));
        assert!(!dst.exists());

        let budget = CopyBudget::new(25);
        let outcome = fallback_copy(&src, &dst, &budget).unwrap();
        assert_eq!(outcome, TransferOutcome::Copied(10));
        assert_eq!(budget.remaining(), 15);
        assert_eq!(fs::read_to_string(&dst).unwrap(), "0123456789");
    }

    #[test]
    fn same_location_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let inst = tmp.path().join("inst");
        assert!(matches!(
            check_same_location(&inst, &tmp.path().join("./inst")),
            Err(MigrationError::SourceEqualsDestination(_))
        ));
        assert!(check_same_location(&inst, &tmp.path().join("other")).is_ok());
    }

    #[test]
    fn failing_job_is_contained() {
        let tmp = tempfile::tempdir().unwrap();
        let good_src = tmp.path().join("good.txt");
        fs::write(&good_src, "ok").unwrap();
        let blocked = tmp.path().join("out/bad/blocked.txt");
        fs::create_dir_all(&blocked).unwrap();

        let jobs = vec![
            TransferJob {
                mod_id: "Good".to_string(),
                files: vec![FilePlan {
                    source: good_src.clone(),
                    dest: tmp.path().join("out/good/good.txt"),
                    size: 2,
                    mode: TransferMode::Copy,
                }],
            },
            TransferJob {
                mod_id: "Bad".to_string(),
                files: vec![FilePlan {
                    source: good_src,
                    dest: blocked,
                    size: 2,
                    mode: TransferMode::Copy,
                }],
            },
        ];
        let report = ReportCollector::new();
        let options = TransferOptions {
            use_hardlinks: false,
            replace_existing: true,
            worker_threads: 2,
        };
        let stats = run_jobs(
            &jobs,
            &options,
            &CancelToken::new(),
            &CopyBudget::unlimited(),
            &report,
            &ProgressReporter::default(),
        )
        .unwrap();
        assert_eq!(stats.copied, 1);
        assert_eq!(stats.failed, 1);
        let report = report.finish();
        assert_eq!(report.failed_mods().len(), 1);
        assert_eq!(report.failed_mods()[0].id, "Bad");
        assert!(tmp.path().join("out/good/good.txt").exists());
    }

    #[test]
    fn cancelled_run_stops_early() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.txt");
        fs::write(&src, "x").unwrap();
        let jobs = vec![TransferJob {
            mod_id: "A".to_string(),
            files: vec![FilePlan {
                source: src,
                dest: tmp.path().join("out/a.txt"),
                size: 1,
                mode: TransferMode::Copy,
            }],
        }];
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = run_jobs(
            &jobs,
            &TransferOptions::default(),
            &cancel,
            &CopyBudget::unlimited(),
            &ReportCollector::new(),
            &ProgressReporter::default(),
        );
        assert!(matches!(result, Err(MigrationError::Cancelled)));
        assert!(!tmp.path().join("out/a.txt").exists());
    }

    #[test]
    fn mod_names_are_sanitized_and_truncated() {
        assert_eq!(sanitize_mod_name("SkyUI: Remastered?", 100), "SkyUI Remastered");
        assert_eq!(sanitize_mod_name("Some Long - Name", 11), "Some Long");
        assert_eq!(sanitize_mod_name("Trailing dots...", 100), "Trailing dots");
        assert_eq!(sanitize_mod_name("???", 10), "Unnamed Mod");
        assert_eq!(sanitize_mod_name("Ünïcödé Mod", 5), "Ünïcö");
    }
}
