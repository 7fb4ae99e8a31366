use crate::{
    config::AppConfig,
    conflicts,
    error::{MigrationError, MigrationResult},
    instance::{FileEntry, FileScope, Instance, Mod, Tool, ToolLocation},
    manager::{InstanceDescriptor, ModManager, ModPlacement},
    paths,
    progress::{MigrationState, ProgressCallback, ProgressReporter},
    report::{Advisory, MigrationReport, ReportCollector},
    transfer::{
        self, CancelToken, CopyBudget, FilePlan, ModeCache, SpaceProbe, SystemSpaceProbe,
        TransferJob, TransferMode, TransferOptions,
    },
};
use anyhow::{anyhow, Context};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub transfer: TransferOptions,
    pub modname_limit: usize,
    pub activate: bool,
    pub mo2_download_url: String,
    pub mo2_download_sha256: Option<String>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for MigrationOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            transfer: TransferOptions {
                use_hardlinks: config.use_hardlinks,
                replace_existing: config.replace_existing,
                worker_threads: config.worker_threads.max(1),
            },
            modname_limit: config.modname_limit.max(1),
            activate: config.activate_new_instance,
            mo2_download_url: config.mo2_download_url.clone(),
            mo2_download_sha256: config.mo2_download_sha256.clone(),
        }
    }
}

#[derive(Debug)]
pub struct MigrationOutcome {
    pub status: MigrationState,
    pub report: MigrationReport,
    pub error: Option<MigrationError>,
}

struct PlannedMod {
    index: usize,
    placement: ModPlacement,
    files: Vec<FileEntry>,
    job: TransferJob,
}

type ConfigPlan = (&'static str, MigrationResult<Vec<FilePlan>>);

pub struct Migrator {
    source: Box<dyn ModManager>,
    destination: Box<dyn ModManager>,
    options: MigrationOptions,
    progress: ProgressReporter,
    cancel: CancelToken,
    space_probe: Box<dyn SpaceProbe>,
    state: MigrationState,
}

impl Migrator {
    pub fn new(
        source: Box<dyn ModManager>,
        destination: Box<dyn ModManager>,
        options: MigrationOptions,
    ) -> Self {
        Self {
            source,
            destination,
            options,
            progress: ProgressReporter::default(),
            cancel: CancelToken::new(),
            space_probe: Box::new(SystemSpaceProbe),
            state: MigrationState::Idle,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = ProgressReporter::new(Some(callback));
        self
    }

    pub fn with_space_probe(mut self, probe: impl SpaceProbe + 'static) -> Self {
        self.space_probe = Box::new(probe);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    pub fn run(
        &mut self,
        source: &InstanceDescriptor,
        destination: &InstanceDescriptor,
    ) -> MigrationOutcome {
        let collector = ReportCollector::new();
        let result = self.execute(source, destination, &collector);
        let error = match result {
            Ok(()) => None,
            Err(err) if err.is_fatal() => {
                error!("migration aborted: {err:#}");
                Some(err)
            }
            Err(err) => {
                error!(state = %self.state, "migration step failed: {err:#}");
                collector.step_failed(self.state.label(), format!("{err:#}"));
                None
            }
        };
        let report = collector.finish();
        let status = match &error {
            Some(_) => MigrationState::Aborted,
            None if report.has_errors() => MigrationState::CompletedWithErrors,
            None => MigrationState::Completed,
        };
        self.enter(status);
        info!(status = %status, "{}", report.summary());
        MigrationOutcome {
            status,
            report,
            error,
        }
    }

    fn enter(&mut self, state: MigrationState) {
        debug!(from = %self.state, to = %state, "migration state");
        self.state = state;
        self.progress.enter(state);
    }

    fn checkpoint(&self) -> MigrationResult<()> {
        if self.cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }
        Ok(())
    }

    fn execute(
        &mut self,
        source: &InstanceDescriptor,
        destination: &InstanceDescriptor,
        report: &ReportCollector,
    ) -> MigrationResult<()> {
        self.enter(MigrationState::LoadingSource);
        let src = self
            .source
            .load_instance(source)
            .map_err(|err| {
                fatal_or(err, |err| MigrationError::SourceUnreadable(format!("{err:#}")))
            })?;
        for advisory in &src.advisories {
            report.advise(advisory.clone());
        }
        info!(
            manager = %src.kind,
            instance = %src.name,
            mods = src.mods.len(),
            tools = src.tools.len(),
            "loaded source instance"
        );
        self.checkpoint()?;

        self.enter(MigrationState::LoadingDestination);
        transfer::check_same_location(&source.root, &destination.root)?;
        let mut dst = self
            .destination
            .prepare_destination(destination, &self.options)
            .map_err(|err| {
                fatal_or(err, |err| MigrationError::InvalidDestinationPath(format!("{err:#}")))
            })?;
        transfer::check_same_location(&src.mods_dir, &dst.mods_dir)?;
        if !dst.exists {
            dst.separate_ini_files = src.separate_ini_files;
            dst.separate_saves = src.separate_saves;
        }
        info!(
            manager = %dst.kind,
            root = %dst.root.display(),
            existing = dst.exists,
            "prepared destination"
        );
        self.checkpoint()?;

        self.enter(MigrationState::ResolvingConflicts);
        let mut by_owner = self.collect_files(&src, report)?;
        let mut planned = Vec::new();
        let mut required = 0u64;
        let mut mode_cache = ModeCache::new(self.options.transfer.use_hardlinks);
        let mut claimed: HashMap<String, String> = HashMap::new();
        let mut order: Vec<usize> = (0..src.mods.len()).collect();
        order.sort_by_key(|index| src.mods[*index].priority);
        for (step, index) in order.into_iter().enumerate() {
            let entry = &src.mods[index];
            self.progress.report(
                MigrationState::ResolvingConflicts,
                step,
                src.mods.len(),
                Some(entry.name.clone()),
            );
            if report.is_mod_failed(&entry.id) {
                continue;
            }
            let files = by_owner.remove(&index).unwrap_or_default();
            let scopes: BTreeSet<FileScope> = files.iter().map(|file| file.scope).collect();
            let placement =
                match self
                    .destination
                    .place_mod(&dst, entry, &scopes, &self.options)
                {
                    Ok(placement) => placement,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        warn!(mod_id = %entry.id, "cannot place mod: {err:#}");
                        report.fail_mod(&entry.id, format!("{err:#}"));
                        continue;
                    }
                };
            if let Some((id, owner)) = placement
                .records
                .iter()
                .find_map(|record| claimed.get(&record.id).map(|owner| (&record.id, owner)))
            {
                report.fail_mod(
                    &entry.id,
                    format!("destination name {id} is already used by {owner}"),
                );
                continue;
            }
            for record in &placement.records {
                claimed.insert(record.id.clone(), entry.id.clone());
            }

            let mut job = TransferJob {
                mod_id: entry.id.clone(),
                files: Vec::with_capacity(files.len()),
            };
            for file in &files {
                let target_root = placement.target(file.scope);
                let mode = mode_cache.mode_for(&entry.path, target_root);
                if mode == TransferMode::Copy {
                    required += file.size;
                }
                job.files.push(FilePlan {
                    source: file.source.clone(),
                    dest: target_root.join(&file.relative_path),
                    size: file.size,
                    mode,
                });
            }
            planned.push(PlannedMod {
                index,
                placement,
                files,
                job,
            });
        }

        let config_plans = self.plan_config_files(&src, &dst);
        required += config_plans
            .iter()
            .filter_map(|(_, plan)| plan.as_ref().ok())
            .flatten()
            .map(|file| file.size)
            .sum::<u64>();
        let available = transfer::check_space(required, &dst.mods_dir, self.space_probe.as_ref())?;
        let budget = CopyBudget::new(available.saturating_sub(required));
        self.checkpoint()?;

        self.enter(MigrationState::MigratingMods);
        self.destination
            .create_layout(&dst, &self.options, &self.progress)
            .map_err(|err| {
                fatal_or(err, |err| {
                    MigrationError::InvalidDestinationPath(format!(
                        "cannot create destination layout: {err:#}"
                    ))
                })
            })?;
        if let Err(err) = self
            .destination
            .install_manager(&dst, &self.options, &self.progress)
        {
            warn!("manager install failed: {err:#}");
            report.step_failed("install mod manager", format!("{err:#}"));
            report.advise(Advisory::InstallManager {
                path: dst.root.clone(),
            });
        }
        let jobs: Vec<TransferJob> = planned.iter().map(|item| item.job.clone()).collect();
        transfer::run_jobs(
            &jobs,
            &self.options.transfer,
            &self.cancel,
            &budget,
            report,
            &self.progress,
        )?;

        let mut migrated: HashMap<String, usize> = HashMap::new();
        let mut entries: Vec<FileEntry> = Vec::new();
        for (slot, item) in planned.iter().enumerate() {
            let entry = &src.mods[item.index];
            if report.is_mod_failed(&entry.id) {
                continue;
            }
            self.destination
                .register_mods(&mut dst, item.placement.records.clone());
            entries.extend(item.files.iter().cloned());
            migrated.insert(entry.id.clone(), slot);
            if !entry.is_separator() {
                report.mod_migrated();
            }
        }
        self.checkpoint()?;

        self.enter(MigrationState::MigratingTools);
        let tools: Vec<&Tool> = self
            .source
            .list_tools(&src)
            .into_iter()
            .filter(|tool| tool.included)
            .collect();
        for (step, tool) in tools.iter().enumerate() {
            self.progress.report(
                MigrationState::MigratingTools,
                step,
                tools.len(),
                Some(tool.name.clone()),
            );
            match self.migrate_tool(tool, &src, &dst, &planned, &migrated) {
                Ok(mapped) => {
                    merge_tool(&mut dst.tools, mapped);
                    report.tool_migrated();
                }
                Err(err) => {
                    warn!(tool = %tool.name, "tool not migrated: {err:#}");
                    report.fail_tool(&tool.name, format!("{err:#}"));
                }
            }
        }
        self.checkpoint()?;

        self.enter(MigrationState::MigratingConfig);
        for (step, plan) in config_plans {
            let result = plan.and_then(|files| copy_config_files(&files, &budget));
            if let Err(err) = result {
                warn!(step, "config migration failed: {err:#}");
                report.step_failed(step, format!("{err:#}"));
            }
        }
        if let Err(err) = self.destination.write_instance(&dst, &entries, &dst.tools) {
            report.step_failed("write instance metadata", format!("{err:#}"));
        }
        if self.options.activate {
            if let Err(err) = self.destination.activate(&dst) {
                report.step_failed("activate instance", format!("{err:#}"));
            }
        }
        for advisory in self.destination.advisories(&dst, &entries) {
            report.advise(advisory);
        }
        Ok(())
    }

    fn collect_files(
        &self,
        src: &Instance,
        report: &ReportCollector,
    ) -> MigrationResult<BTreeMap<usize, Vec<FileEntry>>> {
        let map = conflicts::resolve(&src.mods)?;
        for unreadable in map.unreadable() {
            report.fail_mod(&unreadable.mod_id, unreadable.reason.clone());
        }
        let single = map.single_file_conflicts().to_vec();
        if !single.is_empty() {
            report.advise(Advisory::SingleFileConflicts {
                count: single.len(),
            });
            report.add_conflicts(single);
        }
        info!(
            files = map.len(),
            overridden = map.overridden(),
            bytes = map.total_bytes(),
            "resolved conflicts"
        );

        let mut by_owner: BTreeMap<usize, Vec<FileEntry>> = BTreeMap::new();
        for entry in map.into_entries() {
            by_owner.entry(entry.owner).or_default().push(entry);
        }
        for (index, entry) in src.mods.iter().enumerate() {
            if entry.participates() || entry.is_separator() {
                continue;
            }
            match conflicts::enumerate_mod(entry, index) {
                Ok(files) if !files.is_empty() => {
                    by_owner.insert(index, files);
                }
                Ok(_) => {}
                Err(err) => report.fail_mod(&entry.id, format!("{err:#}")),
            }
        }
        Ok(by_owner)
    }

    fn migrate_tool(
        &self,
        tool: &Tool,
        src: &Instance,
        dst: &Instance,
        planned: &[PlannedMod],
        migrated: &HashMap<String, usize>,
    ) -> MigrationResult<Tool> {
        if tool.location == ToolLocation::External {
            return Err(MigrationError::ToolOutsideInstance {
                name: tool.name.clone(),
                path: tool.executable.clone(),
            });
        }
        if !tool.executable.is_file() {
            return Err(MigrationError::ToolMissing {
                name: tool.name.clone(),
                path: tool.executable.clone(),
            });
        }
        let (source_mod, placement): (Option<&Mod>, Option<&ModPlacement>) = match tool.owner() {
            Some(owner) => {
                let slot = migrated
                    .get(owner)
                    .ok_or_else(|| anyhow!("owning mod {owner} was not migrated"))?;
                let item = &planned[*slot];
                (Some(&src.mods[item.index]), Some(&item.placement))
            }
            None => (None, None),
        };
        self.destination.place_tool(dst, tool, source_mod, placement)
    }

    fn plan_config_files(&self, src: &Instance, dst: &Instance) -> Vec<ConfigPlan> {
        let ini = self.source.ini_dir(src).and_then(|from| {
            let to = self.destination.ini_dir(dst)?;
            plan_copies(&from, &to, src.game.ini_files())
        });
        let additional = plan_copies(
            &self.source.additional_files_dir(src),
            &self.destination.additional_files_dir(dst),
            src.game.additional_files(),
        );
        vec![("ini files", ini), ("additional files", additional)]
    }
}

fn plan_copies(from: &Path, to: &Path, names: &[&str]) -> MigrationResult<Vec<FilePlan>> {
    if paths::same_location(from, to) {
        return Ok(Vec::new());
    }
    let mut plans = Vec::new();
    for name in names {
        let Some(source) = find_case_insensitive(from, name) else {
            continue;
        };
        let size = fs::metadata(&source)
            .with_context(|| format!("stat {:?}", source))?
            .len();
        plans.push(FilePlan {
            source,
            dest: to.join(name),
            size,
            mode: TransferMode::Copy,
        });
    }
    Ok(plans)
}

fn find_case_insensitive(dir: &Path, name: &str) -> Option<PathBuf> {
    let exact = dir.join(name);
    if exact.is_file() {
        return Some(exact);
    }
    fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .find(|entry| {
            entry.file_name().to_string_lossy().eq_ignore_ascii_case(name)
                && entry.file_type().map(|kind| kind.is_file()).unwrap_or(false)
        })
        .map(|entry| entry.path())
}

fn fatal_or(
    err: MigrationError,
    wrap: impl FnOnce(MigrationError) -> MigrationError,
) -> MigrationError {
    if err.is_fatal() {
        err
    } else {
        wrap(err)
    }
}

fn copy_config_files(files: &[FilePlan], budget: &CopyBudget) -> MigrationResult<()> {
    let mut failures = Vec::new();
    for file in files {
        if let Err(err) = transfer::transfer_file(&file.source, &file.dest, file.mode, true, budget)
        {
            failures.push(format!("{}: {err:#}", file.dest.display()));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(MigrationError::Other(anyhow!(failures.join("; "))))
    }
}

fn merge_tool(tools: &mut Vec<Tool>, tool: Tool) {
    match tools
        .iter_mut()
        .find(|existing| existing.name.eq_ignore_ascii_case(&tool.name))
    {
        Some(existing) => *existing = tool,
        None => tools.push(tool),
    }
}
