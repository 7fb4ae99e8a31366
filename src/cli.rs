use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mod_migrator::{
    config::AppConfig,
    conflicts,
    game::{self, GameId},
    instance::{Instance, ManagerKind, ToolLocation},
    manager::{self, InstanceDescriptor, ManagerOptions, Mo2InstanceType, Mo2Options, VortexOptions},
    migrator::{MigrationOptions, Migrator},
    modorganizer::{scan_global_instances, ModOrganizer},
    paths,
    progress::{MigrationProgress, MigrationState},
};
use parking_lot::Mutex;
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};

const EXIT_OK: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_PARTIAL: i32 = 2;

#[derive(Parser)]
#[command(name = "mod-migrator", version, about = "Migrate mod instances between Mod Organizer 2 and Vortex")]
struct Cli {
    /// Output format.
    #[arg(long, value_enum, global = true, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ManagerArg {
    Mo2,
    Vortex,
}

#[derive(Subcommand)]
enum Command {
    /// Copy or link a source instance's mods, tools and config into a destination.
    Migrate(MigrateArgs),
    /// Show the mods and tools of an instance.
    Inspect(InspectArgs),
    /// List global Mod Organizer 2 instances.
    Instances,
    /// List supported games.
    Games,
}

#[derive(Args)]
struct MigrateArgs {
    #[arg(long)]
    game: String,
    #[arg(long, value_enum)]
    from: ManagerArg,
    /// MO2 base directory or Vortex app data folder.
    #[arg(long)]
    source_root: Option<PathBuf>,
    #[arg(long, default_value = "")]
    source_profile: String,
    #[arg(long, value_enum)]
    to: ManagerArg,
    #[arg(long)]
    dest_root: Option<PathBuf>,
    /// MO2 instance name, or the name of a new Vortex profile.
    #[arg(long, default_value = "")]
    dest_name: String,
    #[arg(long, default_value = "")]
    dest_profile: String,
    #[arg(long)]
    game_dir: Option<PathBuf>,
    /// Create a global MO2 instance instead of a portable one.
    #[arg(long)]
    global: bool,
    #[arg(long)]
    no_root_builder: bool,
    /// Download MO2 into a new portable instance.
    #[arg(long)]
    install_mo2: bool,
    #[arg(long)]
    staging_folder: Option<PathBuf>,
    /// Always copy instead of hardlinking.
    #[arg(long)]
    copy: bool,
    #[arg(long)]
    replace_existing: bool,
    #[arg(long)]
    no_activate: bool,
}

#[derive(Args)]
struct InspectArgs {
    #[arg(long)]
    game: String,
    #[arg(long, value_enum)]
    manager: ManagerArg,
    #[arg(long)]
    root: Option<PathBuf>,
    #[arg(long, default_value = "")]
    profile: String,
}

pub fn run(config: &AppConfig) -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Migrate(args) => migrate(config, args, cli.format),
        Command::Inspect(args) => inspect(args, cli.format),
        Command::Instances => list_instances(cli.format),
        Command::Games => list_games(cli.format),
    }
}

fn default_root(manager: ManagerArg) -> Result<PathBuf> {
    match manager {
        ManagerArg::Mo2 => bail!("--source-root/--dest-root is required for Mod Organizer 2"),
        ManagerArg::Vortex => paths::vortex_app_dir(),
    }
}

fn manager_options(manager: ManagerArg, args: Option<&MigrateArgs>) -> ManagerOptions {
    match manager {
        ManagerArg::Mo2 => {
            let mut options = Mo2Options::default();
            if let Some(args) = args {
                if args.global {
                    options.instance_type = Mo2InstanceType::Global;
                }
                options.use_root_builder = !args.no_root_builder;
                options.install_mo2 = args.install_mo2;
            }
            ManagerOptions::ModOrganizer(options)
        }
        ManagerArg::Vortex => ManagerOptions::Vortex(VortexOptions {
            staging_folder: args.and_then(|args| args.staging_folder.clone()),
        }),
    }
}

fn migrate(config: &AppConfig, args: MigrateArgs, format: OutputFormat) -> Result<i32> {
    let game: GameId = args.game.parse()?;
    let source_root = match &args.source_root {
        Some(root) => root.clone(),
        None => default_root(args.from)?,
    };
    let dest_root = match &args.dest_root {
        Some(root) => root.clone(),
        None => default_root(args.to)?,
    };
    let source = InstanceDescriptor {
        name: String::new(),
        game,
        root: source_root,
        profile: args.source_profile.clone(),
        game_dir: args.game_dir.clone(),
        options: manager_options(args.from, None),
    };
    let destination = InstanceDescriptor {
        name: args.dest_name.clone(),
        game,
        root: dest_root,
        profile: args.dest_profile.clone(),
        game_dir: args.game_dir.clone(),
        options: manager_options(args.to, Some(&args)),
    };

    let mut options = MigrationOptions::from(config);
    options.transfer.use_hardlinks &= !args.copy;
    options.transfer.replace_existing |= args.replace_existing;
    options.activate &= !args.no_activate;

    let last_state = Arc::new(Mutex::new(MigrationState::Idle));
    let seen = last_state.clone();
    let show_progress = format == OutputFormat::Text;
    let mut migrator = Migrator::new(
        manager::manager_for(&source)?,
        manager::manager_for(&destination)?,
        options,
    )
    .with_progress(Arc::new(move |progress: MigrationProgress| {
        let mut last = seen.lock();
        if *last != progress.state {
            *last = progress.state;
            if show_progress {
                eprintln!(
                    "[{:>3.0}%] {}",
                    progress.overall_progress * 100.0,
                    progress.state.label()
                );
            }
        }
    }));

    let outcome = migrator.run(&source, &destination);
    match format {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct Output<'a> {
                status: MigrationState,
                error: Option<String>,
                report: &'a mod_migrator::report::MigrationReport,
            }
            let output = Output {
                status: outcome.status,
                error: outcome.error.as_ref().map(|err| format!("{err:#}")),
                report: &outcome.report,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            let report = &outcome.report;
            println!("{}", outcome.status.label());
            if let Some(err) = &outcome.error {
                println!("  error: {err:#}");
            }
            println!("  {}", report.summary());
            for item in report.failed_mods() {
                println!("  mod failed: {} ({})", item.id, item.reason);
            }
            for item in report.failed_tools() {
                println!("  tool failed: {} ({})", item.id, item.reason);
            }
            for item in report.other_errors() {
                println!("  step failed: {} ({})", item.step, item.reason);
            }
            for conflict in report.conflicts() {
                println!(
                    "  conflict: {} kept from {} over {}",
                    conflict.relative_path.display(),
                    conflict.winner,
                    conflict.losers.join(", ")
                );
            }
            for advisory in report.advisories() {
                println!("  note: {advisory}");
            }
        }
    }

    Ok(match outcome.status {
        MigrationState::Completed => EXIT_OK,
        MigrationState::CompletedWithErrors => EXIT_PARTIAL,
        _ => EXIT_FAILED,
    })
}

#[derive(Serialize)]
struct ModItem {
    priority: usize,
    id: String,
    name: String,
    enabled: bool,
    kind: String,
    size: u64,
}

#[derive(Serialize)]
struct ToolItem {
    name: String,
    executable: PathBuf,
    location: String,
}

#[derive(Serialize)]
struct InstanceSummary {
    manager: ManagerKind,
    name: String,
    profile: String,
    mods_dir: PathBuf,
    mods: Vec<ModItem>,
    tools: Vec<ToolItem>,
    conflicts: ConflictSummary,
}

#[derive(Serialize, Default)]
struct ConflictSummary {
    files: usize,
    overridden: usize,
    bytes: u64,
    single_file: Vec<String>,
    unreadable: Vec<String>,
}

fn summarize(instance: &Instance) -> Result<InstanceSummary> {
    let map = conflicts::resolve(&instance.mods)?;
    let conflicts = ConflictSummary {
        files: map.len(),
        overridden: map.overridden(),
        bytes: map.total_bytes(),
        single_file: map
            .single_file_conflicts()
            .iter()
            .map(|conflict| {
                format!(
                    "{} ({} over {})",
                    conflict.relative_path.display(),
                    conflict.winner,
                    conflict.losers.join(", ")
                )
            })
            .collect(),
        unreadable: map
            .unreadable()
            .iter()
            .map(|item| format!("{}: {}", item.mod_id, item.reason))
            .collect(),
    };
    Ok(InstanceSummary {
        manager: instance.kind,
        name: instance.name.clone(),
        profile: instance.profile.clone(),
        mods_dir: instance.mods_dir.clone(),
        mods: instance
            .mods
            .iter()
            .map(|entry| ModItem {
                priority: entry.priority,
                id: entry.id.clone(),
                name: entry.name.clone(),
                enabled: entry.enabled,
                kind: format!("{:?}", entry.kind).to_lowercase(),
                size: entry.size,
            })
            .collect(),
        tools: instance
            .tools
            .iter()
            .map(|tool| ToolItem {
                name: tool.name.clone(),
                executable: tool.executable.clone(),
                location: match &tool.location {
                    ToolLocation::InMod { mod_id, .. } => format!("mod:{mod_id}"),
                    ToolLocation::InGameDir { .. } => "game".to_string(),
                    ToolLocation::External => "external".to_string(),
                },
            })
            .collect(),
        conflicts,
    })
}

fn inspect(args: InspectArgs, format: OutputFormat) -> Result<i32> {
    let descriptor = InstanceDescriptor {
        name: String::new(),
        game: args.game.parse()?,
        root: match args.root {
            Some(root) => root,
            None => default_root(args.manager)?,
        },
        profile: args.profile,
        game_dir: None,
        options: manager_options(args.manager, None),
    };
    let manager = manager::manager_for(&descriptor)?;
    let instance = manager.load_instance(&descriptor)?;
    let summary = summarize(&instance)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text => {
            println!("{} [{}] {}", summary.name, summary.profile, summary.mods_dir.display());
            for item in &summary.mods {
                let enabled = if item.enabled { "x" } else { " " };
                println!(
                    "{priority:>4} [{enabled}] {kind:<9} {name}",
                    priority = item.priority,
                    kind = item.kind,
                    name = item.name
                );
            }
            for tool in &summary.tools {
                println!("tool {} ({}) {}", tool.name, tool.location, tool.executable.display());
            }
            let conflicts = &summary.conflicts;
            println!(
                "{} file(s), {} overridden, {} to migrate",
                conflicts.files,
                conflicts.overridden,
                mod_migrator::error::format_bytes(conflicts.bytes)
            );
            for conflict in &conflicts.single_file {
                println!("conflict {conflict}");
            }
            for item in &conflicts.unreadable {
                println!("unreadable {item}");
            }
            for advisory in &instance.advisories {
                println!("note: {advisory}");
            }
        }
    }
    Ok(EXIT_OK)
}

fn list_instances(format: OutputFormat) -> Result<i32> {
    let mo2 = ModOrganizer::new()?;
    let instances = scan_global_instances(mo2.global_root())?;
    match format {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct Item<'a> {
                name: &'a str,
                root: &'a PathBuf,
                game: Option<GameId>,
            }
            let items: Vec<Item> = instances
                .iter()
                .map(|instance| Item {
                    name: &instance.name,
                    root: &instance.root,
                    game: instance.game,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Text => {
            for instance in &instances {
                let game = instance
                    .game
                    .map(|game| game.display_name())
                    .unwrap_or("unknown game");
                println!("{} ({game}) {}", instance.name, instance.root.display());
            }
        }
    }
    Ok(EXIT_OK)
}

fn list_games(format: OutputFormat) -> Result<i32> {
    let games = game::supported_games();
    match format {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct Item {
                id: &'static str,
                name: &'static str,
            }
            let items: Vec<Item> = games
                .iter()
                .map(|game| Item {
                    id: game.as_str(),
                    name: game.display_name(),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Text => {
            for game in games {
                println!("{:<10} {}", game.as_str(), game.display_name());
            }
        }
    }
    Ok(EXIT_OK)
}
