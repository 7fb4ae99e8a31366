use crate::{
    conflicts::ROOT_FOLDER,
    download,
    error::{MigrationError, MigrationResult},
    game::{self, GameId},
    instance::{
        dir_size, locate_tool, FileEntry, FileScope, Instance, ManagerKind, Mod, ModKind, Tool,
    },
    manager::{
        self, InstanceDescriptor, ManagerOptions, Mo2InstanceType, Mo2Options, ModManager,
        ModPlacement,
    },
    migrator::MigrationOptions,
    paths,
    progress::ProgressReporter,
    report::Advisory,
    transfer::sanitize_mod_name,
};
use anyhow::{anyhow, Context, Result};
use ini::{EscapePolicy, Ini, ParseOption};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const INI_FILE: &str = "ModOrganizer.ini";
pub const MODLIST_FILE: &str = "modlist.txt";
pub const PROFILE_SETTINGS_FILE: &str = "settings.ini";
pub const META_FILE: &str = "meta.ini";
pub const MO2_EXE: &str = "ModOrganizer.exe";
pub const SEPARATOR_SUFFIX: &str = "_separator";
pub const OVERWRITE_ID: &str = "Overwrite";
const EXECUTABLES: &str = "customExecutables";
const DEFAULT_PROFILE: &str = "Default";
const MODLIST_HEADER: &str = "# This file was automatically generated by Mod Organizer.";

pub struct ModOrganizer {
    global_root: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalInstance {
    pub name: String,
    pub root: PathBuf,
    pub game: Option<GameId>,
}

#[derive(Debug, Clone)]
struct Layout {
    mods: PathBuf,
    profiles: PathBuf,
    overwrite: PathBuf,
    downloads: PathBuf,
}

impl Layout {
    fn resolve(root: &Path, ini: Option<&Ini>, options: &Mo2Options) -> Self {
        let settings = ini.and_then(|ini| ini.section(Some("Settings")));
        let get = |key: &str| {
            settings
                .and_then(|section| section.get(key))
                .map(decode_value)
                .filter(|value| !value.is_empty())
        };
        let base = match get("base_directory") {
            Some(raw) => absolutize(root, resolve_base(&raw, root)),
            None => root.to_path_buf(),
        };
        let dir = |key: &str, fallback: Option<&PathBuf>, default: &str| match get(key) {
            Some(raw) => absolutize(&base, resolve_base(&raw, &base)),
            None => fallback.cloned().unwrap_or_else(|| base.join(default)),
        };
        Self {
            mods: dir("mod_directory", options.mods_folder.as_ref(), "mods"),
            profiles: dir("profiles_directory", options.profiles_folder.as_ref(), "profiles"),
            overwrite: dir("overwrite_directory", None, "overwrite"),
            downloads: dir("download_directory", None, "downloads"),
        }
    }
}

fn resolve_base(raw: &str, base: &Path) -> PathBuf {
    paths::resolve_placeholders(&native_separators(raw), &[("BASE_DIR", base)])
}

fn absolutize(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

impl ModOrganizer {
    pub fn new() -> MigrationResult<Self> {
        Ok(Self::with_global_root(paths::mo2_global_root()?))
    }

    pub fn with_global_root(global_root: impl Into<PathBuf>) -> Self {
        Self {
            global_root: global_root.into(),
        }
    }

    pub fn global_root(&self) -> &Path {
        &self.global_root
    }

    fn read_instance(
        &self,
        descriptor: &InstanceDescriptor,
        require_profile: bool,
    ) -> MigrationResult<Instance> {
        let root = &descriptor.root;
        let ini_path = root.join(INI_FILE);
        if !ini_path.is_file() {
            return Err(MigrationError::InstanceNotFound(format!(
                "{} (no {INI_FILE})",
                root.display()
            )));
        }
        let ini = load_ini(&ini_path)?;
        let options = mo2_options(&descriptor.options);
        let layout = Layout::resolve(root, Some(&ini), &options);
        let general = ini.section(Some("General"));
        let general_value = |key: &str| {
            general
                .and_then(|section| section.get(key))
                .map(decode_value)
                .filter(|value| !value.is_empty())
        };

        if let Some(name) = general_value("gameName") {
            if GameId::from_mo2_name(&name) != Some(descriptor.game) {
                warn!(game = %name, expected = descriptor.game.mo2_name(), "instance manages a different game");
            }
        }

        let profile = if descriptor.profile.is_empty() {
            general_value("selected_profile").unwrap_or_else(|| DEFAULT_PROFILE.to_string())
        } else {
            descriptor.profile.clone()
        };
        let profile_dir = layout.profiles.join(&profile);
        if require_profile && !profile_dir.is_dir() {
            return Err(MigrationError::InstanceNotFound(format!(
                "profile {profile} in {}",
                root.display()
            )));
        }
        let (separate_saves, separate_ini_files) = read_profile_settings(&profile_dir);

        let game_dir = general_value("gamePath")
            .map(|raw| PathBuf::from(native_separators(&raw)))
            .or_else(|| descriptor.game_dir.clone())
            .or_else(|| game::detect_install_dir(descriptor.game).ok())
            .unwrap_or_default();

        let (mut mods, unmanaged) = read_mods(&layout.mods, &profile_dir)?;
        let mut advisories = Vec::new();
        if !unmanaged.is_empty() {
            warn!(count = unmanaged.len(), "mod folders missing from modlist.txt");
            advisories.push(Advisory::UnmanagedMods { names: unmanaged });
        }
        if has_files(&layout.overwrite) {
            let mut overwrite = Mod::new(OVERWRITE_ID, OVERWRITE_ID, layout.overwrite.clone());
            overwrite.kind = ModKind::Overwrite;
            overwrite.priority = mods.len();
            overwrite.size = dir_size(&overwrite.path);
            mods.push(overwrite);
        }
        let tools = read_tools(&ini, &mods, &game_dir);

        let name = if descriptor.name.is_empty() {
            root.file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default()
        } else {
            descriptor.name.clone()
        };
        debug!(mods = mods.len(), tools = tools.len(), %profile, "read MO2 instance");

        Ok(Instance {
            kind: ManagerKind::ModOrganizer,
            name,
            game: descriptor.game,
            game_dir,
            root: root.clone(),
            profile,
            mods_dir: layout.mods,
            profile_dir,
            mods,
            tools,
            separate_ini_files,
            separate_saves,
            exists: true,
            options: descriptor.options.clone(),
            advisories,
        })
    }

    fn layout_for(&self, instance: &Instance) -> Layout {
        let ini = load_ini(&instance.root.join(INI_FILE)).ok();
        let mut layout = Layout::resolve(&instance.root, ini.as_ref(), &mo2_options(&instance.options));
        layout.mods = instance.mods_dir.clone();
        if let Some(parent) = instance.profile_dir.parent() {
            layout.profiles = parent.to_path_buf();
        }
        layout
    }
}

impl ModManager for ModOrganizer {
    fn kind(&self) -> ManagerKind {
        ManagerKind::ModOrganizer
    }

    fn load_instance(&self, descriptor: &InstanceDescriptor) -> MigrationResult<Instance> {
        self.read_instance(descriptor, true)
    }

    fn prepare_destination(
        &self,
        descriptor: &InstanceDescriptor,
        _options: &MigrationOptions,
    ) -> MigrationResult<Instance> {
        let options = mo2_options(&descriptor.options);
        let root = &descriptor.root;
        if root.as_os_str().is_empty() {
            return Err(MigrationError::InvalidDestinationPath(
                "no instance directory given".to_string(),
            ));
        }
        if root.is_file() {
            return Err(MigrationError::InvalidDestinationPath(format!(
                "{} is a file",
                root.display()
            )));
        }
        match options.instance_type {
            Mo2InstanceType::Global => {
                if !paths::is_within(root, &self.global_root) {
                    return Err(MigrationError::InvalidDestinationPath(format!(
                        "global instances must live under {}",
                        self.global_root.display()
                    )));
                }
                if options.install_mo2 {
                    return Err(MigrationError::InvalidDestinationPath(
                        "Mod Organizer 2 cannot be installed into a global instance".to_string(),
                    ));
                }
            }
            Mo2InstanceType::Portable => {
                let globals = scan_global_instances(&self.global_root)?;
                if !globals.is_empty() {
                    let names: Vec<&str> = globals.iter().map(|item| item.name.as_str()).collect();
                    return Err(MigrationError::InvalidDestinationPath(format!(
                        "global Mod Organizer 2 instances exist under {} ({}); a portable instance would be shadowed",
                        self.global_root.display(),
                        names.join(", ")
                    )));
                }
            }
        }

        if root.join(INI_FILE).is_file() {
            return self.read_instance(descriptor, false);
        }

        let layout = Layout::resolve(root, None, &options);
        let profile = if descriptor.profile.is_empty() {
            DEFAULT_PROFILE.to_string()
        } else {
            descriptor.profile.clone()
        };
        let game_dir = descriptor
            .game_dir
            .clone()
            .or_else(|| game::detect_install_dir(descriptor.game).ok())
            .unwrap_or_default();
        let name = if descriptor.name.is_empty() {
            root.file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default()
        } else {
            descriptor.name.clone()
        };
        Ok(Instance {
            kind: ManagerKind::ModOrganizer,
            name,
            game: descriptor.game,
            game_dir,
            root: root.clone(),
            profile_dir: layout.profiles.join(&profile),
            profile,
            mods_dir: layout.mods,
            mods: Vec::new(),
            tools: Vec::new(),
            separate_ini_files: true,
            separate_saves: false,
            exists: false,
            options: descriptor.options.clone(),
            advisories: Vec::new(),
        })
    }

    fn create_layout(
        &self,
        instance: &Instance,
        _options: &MigrationOptions,
        _progress: &ProgressReporter,
    ) -> MigrationResult<()> {
        let layout = self.layout_for(instance);
        for dir in [
            &instance.root,
            &layout.mods,
            &instance.profile_dir,
            &layout.overwrite,
            &layout.downloads,
        ] {
            fs::create_dir_all(dir).with_context(|| format!("create {:?}", dir))?;
        }
        if !instance.exists {
            write_new_ini(instance, &layout)?;
            info!(root = %instance.root.display(), "created MO2 instance");
        }
        if !instance.profile_dir.join(PROFILE_SETTINGS_FILE).is_file() {
            write_profile_settings(instance)?;
        }
        Ok(())
    }

    fn install_manager(
        &self,
        instance: &Instance,
        options: &MigrationOptions,
        progress: &ProgressReporter,
    ) -> MigrationResult<()> {
        let mo2 = mo2_options(&instance.options);
        if mo2.instance_type != Mo2InstanceType::Portable
            || !mo2.install_mo2
            || instance.root.join(MO2_EXE).is_file()
        {
            return Ok(());
        }
        download::install_mo2(
            &options.mo2_download_url,
            options.mo2_download_sha256.as_deref(),
            &instance.root,
            progress,
        )?;
        Ok(())
    }

    fn place_mod(
        &self,
        destination: &Instance,
        source: &Mod,
        scopes: &BTreeSet<FileScope>,
        options: &MigrationOptions,
    ) -> MigrationResult<ModPlacement> {
        let mo2 = mo2_options(&destination.options);
        match source.kind {
            ModKind::Overwrite => {
                let layout = self.layout_for(destination);
                let root_root = if mo2.use_root_builder {
                    layout.overwrite.join(ROOT_FOLDER)
                } else {
                    destination.game_dir.clone()
                };
                return Ok(ModPlacement {
                    data_root: layout.overwrite,
                    root_root,
                    records: Vec::new(),
                });
            }
            ModKind::Separator => {
                let label = source
                    .name
                    .strip_suffix(SEPARATOR_SUFFIX)
                    .unwrap_or(&source.name);
                let folder = format!(
                    "{}{SEPARATOR_SUFFIX}",
                    sanitize_mod_name(label, options.modname_limit)
                );
                let mut record = Mod::new(&folder, label, destination.mods_dir.join(&folder));
                record.kind = ModKind::Separator;
                record.enabled = source.enabled;
                return Ok(ModPlacement {
                    records: vec![record],
                    ..ModPlacement::default()
                });
            }
            ModKind::Regular => {}
        }

        let folder = sanitize_mod_name(&source.name, options.modname_limit);
        let data_root = destination.mods_dir.join(&folder);
        let has_root = scopes.contains(&FileScope::Root);
        let root_root = if mo2.use_root_builder {
            data_root.join(ROOT_FOLDER)
        } else {
            if has_root && destination.game_dir.as_os_str().is_empty() {
                return Err(MigrationError::Other(anyhow!(
                    "game directory unknown; cannot place root files of {}",
                    source.name
                )));
            }
            destination.game_dir.clone()
        };

        let needs_record = mo2.use_root_builder || !has_root || scopes.contains(&FileScope::Data);
        let records = if needs_record {
            let mut record = Mod::new(&folder, &folder, data_root.clone());
            record.enabled = source.enabled;
            record.size = source.size;
            record.version = source.version.clone();
            record.metadata = source.metadata.clone();
            vec![record]
        } else {
            Vec::new()
        };
        Ok(ModPlacement {
            data_root,
            root_root,
            records,
        })
    }

    fn ini_dir(&self, instance: &Instance) -> MigrationResult<PathBuf> {
        if instance.separate_ini_files {
            Ok(instance.profile_dir.clone())
        } else {
            Ok(game::ini_dir(instance.game)?)
        }
    }

    fn write_instance(
        &self,
        instance: &Instance,
        entries: &[FileEntry],
        tools: &[Tool],
    ) -> MigrationResult<()> {
        let write = || -> Result<()> {
            fs::create_dir_all(&instance.profile_dir).context("create profile dir")?;
            write_modlist(&instance.profile_dir.join(MODLIST_FILE), &instance.mods)?;
            for entry in &instance.mods {
                match entry.kind {
                    ModKind::Separator => {
                        fs::create_dir_all(&entry.path)
                            .with_context(|| format!("create separator {:?}", entry.path))?;
                    }
                    ModKind::Regular => {
                        if entry.path.is_dir() && !entry.path.join(META_FILE).exists() {
                            write_meta(entry, instance.game)?;
                        }
                    }
                    ModKind::Overwrite => {}
                }
            }
            write_profile_settings(instance)?;
            write_executables(&instance.root.join(INI_FILE), tools)?;
            manager::write_manifest(instance, entries)?;
            Ok(())
        };
        write().map_err(MigrationError::Write)
    }

    fn activate(&self, instance: &Instance) -> MigrationResult<()> {
        let path = instance.root.join(INI_FILE);
        let mut ini = load_ini(&path)?;
        ini.with_section(Some("General"))
            .set("selected_profile", byte_array(&instance.profile));
        save_ini(&ini, &path)?;
        Ok(())
    }

    fn advisories(&self, instance: &Instance, entries: &[FileEntry]) -> Vec<Advisory> {
        let mo2 = mo2_options(&instance.options);
        let mut out = instance.advisories.clone();
        let root_files = entries
            .iter()
            .filter(|entry| entry.scope == FileScope::Root)
            .count();
        if mo2.use_root_builder && root_files > 0 {
            out.push(Advisory::RootBuilderRequired { files: root_files });
        }
        if mo2.instance_type == Mo2InstanceType::Portable && !instance.root.join(MO2_EXE).is_file() {
            out.push(Advisory::InstallManager {
                path: instance.root.clone(),
            });
        }
        out
    }
}

fn mo2_options(options: &ManagerOptions) -> Mo2Options {
    options.mo2().cloned().unwrap_or_default()
}

pub fn scan_global_instances(global_root: &Path) -> Result<Vec<GlobalInstance>> {
    if !global_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(global_root).with_context(|| format!("read {:?}", global_root))? {
        let entry = entry.context("read global instance entry")?;
        let root = entry.path();
        let ini_path = root.join(INI_FILE);
        if !root.is_dir() || !ini_path.is_file() {
            continue;
        }
        let game = load_ini(&ini_path)
            .ok()
            .and_then(|ini| {
                ini.section(Some("General"))
                    .and_then(|section| section.get("gameName"))
                    .map(decode_value)
            })
            .and_then(|name| GameId::from_mo2_name(&name));
        found.push(GlobalInstance {
            name: entry.file_name().to_string_lossy().to_string(),
            root,
            game,
        });
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

fn parse_options() -> ParseOption {
    ParseOption {
        enabled_quote: false,
        enabled_escape: false,
        ..ParseOption::default()
    }
}

fn load_ini(path: &Path) -> Result<Ini> {
    Ini::load_from_file_opt(path, parse_options()).with_context(|| format!("read {:?}", path))
}

fn save_ini(ini: &Ini, path: &Path) -> Result<()> {
    ini.write_to_file_policy(path, EscapePolicy::Nothing)
        .with_context(|| format!("write {:?}", path))
}

/// Unwraps Qt's `@ByteArray(...)` and quoted string encodings.
pub fn decode_value(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix("@ByteArray(")
        .and_then(|rest| rest.strip_suffix(')'));
    if let Some(inner) = inner {
        return inner.replace("\\\\", "\\");
    }
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        return trimmed[1..trimmed.len() - 1]
            .replace("\\\"", "\"")
            .replace("\\\\", "\\");
    }
    trimmed.to_string()
}

fn byte_array(value: &str) -> String {
    format!("@ByteArray({})", value.replace('\\', "\\\\"))
}

fn native_separators(raw: &str) -> String {
    if cfg!(windows) {
        raw.to_string()
    } else {
        raw.replace('\\', "/")
    }
}

fn path_value(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

pub fn trim_version(raw: &str) -> String {
    let mut version = raw.trim().to_string();
    while version.matches('.').count() > 1 && version.ends_with(".0") {
        version.truncate(version.len() - 2);
    }
    version
}

fn read_profile_settings(profile_dir: &Path) -> (bool, bool) {
    let Ok(ini) = load_ini(&profile_dir.join(PROFILE_SETTINGS_FILE)) else {
        return (false, false);
    };
    let flag = |key: &str| {
        ini.section(Some("General"))
            .and_then(|section| section.get(key))
            .map(|value| decode_value(value).eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    };
    (flag("LocalSaves"), flag("LocalSettings"))
}

fn write_profile_settings(instance: &Instance) -> Result<()> {
    let path = instance.profile_dir.join(PROFILE_SETTINGS_FILE);
    let mut ini = if path.is_file() {
        load_ini(&path)?
    } else {
        Ini::new()
    };
    ini.with_section(Some("General"))
        .set("LocalSaves", instance.separate_saves.to_string())
        .set("LocalSettings", instance.separate_ini_files.to_string());
    save_ini(&ini, &path)
}

pub fn read_modlist(path: &Path) -> Result<Vec<(String, bool)>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path).context("read modlist.txt")?;
    let mut entries = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        let (enabled, name) = match line.chars().next() {
            Some('+') => (true, &line[1..]),
            Some('-') => (false, &line[1..]),
            _ => continue,
        };
        let name = name.trim();
        if !name.is_empty() {
            entries.push((name.to_string(), enabled));
        }
    }
    Ok(entries)
}

fn read_mods(mods_dir: &Path, profile_dir: &Path) -> Result<(Vec<Mod>, Vec<String>)> {
    let listed = read_modlist(&profile_dir.join(MODLIST_FILE))?;
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for (name, enabled) in listed.iter().rev() {
        if !seen.insert(name.to_lowercase()) {
            continue;
        }
        let path = mods_dir.join(name);
        let kind = if name.ends_with(SEPARATOR_SUFFIX) {
            ModKind::Separator
        } else {
            ModKind::Regular
        };
        if kind == ModKind::Regular && !path.is_dir() {
            warn!(mod_name = %name, "listed mod folder is missing");
            continue;
        }
        let label = name.strip_suffix(SEPARATOR_SUFFIX).unwrap_or(name);
        let mut entry = Mod::new(name, label, path);
        entry.enabled = *enabled;
        entry.kind = kind;
        if kind == ModKind::Regular {
            read_meta(&mut entry);
            entry.size = dir_size(&entry.path);
        }
        ordered.push(entry);
    }

    let mut unmanaged = Vec::new();
    if mods_dir.is_dir() {
        for item in fs::read_dir(mods_dir).context("read mods dir")? {
            let item = item.context("read mods dir entry")?;
            if !item.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = item.file_name().to_string_lossy().to_string();
            if !seen.contains(&name.to_lowercase()) && !name.ends_with(SEPARATOR_SUFFIX) {
                unmanaged.push(name);
            }
        }
    }
    unmanaged.sort();

    let mut mods = Vec::with_capacity(unmanaged.len() + ordered.len());
    for name in &unmanaged {
        let mut entry = Mod::new(name, name, mods_dir.join(name));
        entry.enabled = false;
        read_meta(&mut entry);
        entry.size = dir_size(&entry.path);
        mods.push(entry);
    }
    mods.extend(ordered);
    for (priority, entry) in mods.iter_mut().enumerate() {
        entry.priority = priority;
    }
    Ok((mods, unmanaged))
}

fn read_meta(entry: &mut Mod) {
    let path = entry.path.join(META_FILE);
    if !path.is_file() {
        return;
    }
    let ini = match load_ini(&path) {
        Ok(ini) => ini,
        Err(err) => {
            warn!(mod_id = %entry.id, "unreadable meta.ini: {err:#}");
            return;
        }
    };
    if let Some(general) = ini.section(Some("General")) {
        let value = |key: &str| {
            general
                .get(key)
                .map(decode_value)
                .filter(|value| !value.is_empty())
        };
        entry.metadata.nexus_mod_id = value("modid")
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(|id| id as u64);
        entry.version = value("version").map(|raw| trim_version(&raw));
        entry.metadata.archive_name = value("installationFile").and_then(|raw| {
            raw.rsplit(|ch| ch == '/' || ch == '\\')
                .next()
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        });
    }
    if let Some(files) = ini.section(Some("installedFiles")) {
        entry.metadata.file_id = files
            .get("1\\fileid")
            .and_then(|raw| decode_value(raw).parse::<u64>().ok())
            .filter(|id| *id > 0);
    }
}

fn write_meta(entry: &Mod, game: GameId) -> Result<()> {
    let mod_id = entry
        .metadata
        .nexus_mod_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "0".to_string());
    let mut ini = Ini::new();
    ini.with_section(Some("General"))
        .set("gameName", game.mo2_name())
        .set("modid", mod_id.clone())
        .set("version", entry.version.clone().unwrap_or_default())
        .set(
            "installationFile",
            entry.metadata.archive_name.clone().unwrap_or_default(),
        );
    if let Some(file_id) = entry.metadata.file_id {
        ini.with_section(Some("installedFiles"))
            .set("size", "1")
            .set("1\\modid", mod_id)
            .set("1\\fileid", file_id.to_string());
    }
    save_ini(&ini, &entry.path.join(META_FILE))
}

fn write_modlist(path: &Path, mods: &[Mod]) -> Result<()> {
    let mut ordered: Vec<&Mod> = mods.iter().filter(|entry| !entry.is_overwrite()).collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
    let mut out = String::from(MODLIST_HEADER);
    out.push('\n');
    for entry in ordered {
        out.push(if entry.enabled { '+' } else { '-' });
        out.push_str(&entry.id);
        out.push('\n');
    }
    manager::write_atomic_text(path, &out)
}

fn write_new_ini(instance: &Instance, layout: &Layout) -> Result<()> {
    let mut ini = Ini::new();
    ini.with_section(Some("General"))
        .set("gameName", instance.game.mo2_name())
        .set("gamePath", byte_array(&path_value(&instance.game_dir)))
        .set("selected_profile", byte_array(&instance.profile));
    if layout.mods != instance.root.join("mods") {
        ini.with_section(Some("Settings"))
            .set("mod_directory", path_value(&layout.mods));
    }
    if layout.profiles != instance.root.join("profiles") {
        ini.with_section(Some("Settings"))
            .set("profiles_directory", path_value(&layout.profiles));
    }
    save_ini(&ini, &instance.root.join(INI_FILE))
}

fn read_tools(ini: &Ini, mods: &[Mod], game_dir: &Path) -> Vec<Tool> {
    let Some(section) = ini.section(Some(EXECUTABLES)) else {
        return Vec::new();
    };
    let size = section
        .get("size")
        .and_then(|raw| decode_value(raw).parse::<usize>().ok())
        .unwrap_or(0);
    let mut tools = Vec::new();
    for index in 1..=size {
        let value = |key: &str| {
            section
                .get(&format!("{index}\\{key}"))
                .map(decode_value)
                .filter(|value| !value.is_empty())
        };
        let (Some(name), Some(binary)) = (value("title"), value("binary")) else {
            continue;
        };
        let executable = PathBuf::from(native_separators(&binary));
        tools.push(Tool {
            location: locate_tool(&executable, mods, game_dir),
            name,
            executable,
            arguments: value("arguments").unwrap_or_default(),
            working_dir: value("workingDirectory").map(|raw| PathBuf::from(native_separators(&raw))),
            included: true,
        });
    }
    tools
}

fn write_executables(path: &Path, tools: &[Tool]) -> Result<()> {
    let mut ini = load_ini(path)?;
    ini.delete(Some(EXECUTABLES));
    let mut section = ini.with_section(Some(EXECUTABLES));
    section.set("size", tools.len().to_string());
    for (index, tool) in tools.iter().enumerate() {
        let n = index + 1;
        section
            .set(format!("{n}\\title"), tool.name.clone())
            .set(format!("{n}\\binary"), path_value(&tool.executable))
            .set(format!("{n}\\arguments"), tool.arguments.clone())
            .set(
                format!("{n}\\workingDirectory"),
                tool.working_dir
                    .as_deref()
                    .map(path_value)
                    .unwrap_or_default(),
            )
            .set(format!("{n}\\ownicon"), "false")
            .set(format!("{n}\\toolbar"), "false")
            .set(format!("{n}\\hide"), "false");
    }
    save_ini(&ini, path)
}

fn has_files(dir: &Path) -> bool {
    dir.is_dir()
        && WalkDir::new(dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_type().is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ToolLocation;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn descriptor(root: &Path, options: Mo2Options) -> InstanceDescriptor {
        InstanceDescriptor {
            name: String::new(),
            game: GameId::SkyrimSe,
            root: root.to_path_buf(),
            profile: String::new(),
            game_dir: Some(root.join("game")),
            options: ManagerOptions::ModOrganizer(options),
        }
    }

    fn fixture(root: &Path) {
        write(
            &root.join(INI_FILE),
            "[General]\ngameName=Skyrim Special Edition\nselected_profile=@ByteArray(Main)\n\n\
             [customExecutables]\nsize=2\n1\\title=SSEEdit\n1\\binary=%ROOT%/mods/xEdit/SSEEdit.exe\n\
             1\\arguments=-quickautoclean\n2\\title=Outside\n2\\binary=/opt/tool.exe\n"
                .replace("%ROOT%", &root.to_string_lossy())
                .as_str(),
        );
        write(
            &root.join("profiles/Main/modlist.txt"),
            "# header\n+xEdit\n-Visuals_separator\n*DLC: Dawnguard\n-Old Mod\n+SkyUI\n",
        );
        write(
            &root.join("profiles/Main/settings.ini"),
            "[General]\nLocalSaves=true\nLocalSettings=false\n",
        );
        write(&root.join("mods/SkyUI/interface/skyui.swf"), "swf");
        write(
            &root.join("mods/SkyUI/meta.ini"),
            "[General]\nmodid=12604\nversion=5.2.0.0\ninstallationFile=C:/Downloads/SkyUI_5_2_SE.7z\n\
             [installedFiles]\n1\\modid=12604\n1\\fileid=35407\nsize=1\n",
        );
        write(&root.join("mods/Old Mod/old.esp"), "old");
        write(&root.join("mods/xEdit/SSEEdit.exe"), "exe");
        write(&root.join("mods/Stray/stray.esp"), "stray");
        fs::create_dir_all(root.join("mods/Visuals_separator")).unwrap();
        write(&root.join("overwrite/SKSE/skse.log"), "log");
    }

    #[test]
    fn reads_load_order_metadata_and_tools() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("inst");
        fixture(&root);
        let manager = ModOrganizer::with_global_root(tmp.path().join("global"));
        let instance = manager
            .load_instance(&descriptor(&root, Mo2Options::default()))
            .unwrap();

        assert_eq!(instance.profile, "Main");
        assert!(instance.separate_saves);
        assert!(!instance.separate_ini_files);
        let ids: Vec<&str> = manager
            .list_mods(&instance)
            .iter()
            .map(|entry| entry.id.as_str())
            .collect();
        assert_eq!(
            ids,
            vec!["Stray", "SkyUI", "Old Mod", "Visuals_separator", "xEdit", OVERWRITE_ID]
        );
        let stray = instance.mod_by_id("Stray").unwrap();
        assert!(!stray.enabled);
        assert_eq!(
            instance.advisories,
            vec![Advisory::UnmanagedMods {
                names: vec!["Stray".to_string()]
            }]
        );

        let skyui = instance.mod_by_id("SkyUI").unwrap();
        assert_eq!(skyui.version.as_deref(), Some("5.2"));
        assert_eq!(skyui.metadata.nexus_mod_id, Some(12604));
        assert_eq!(skyui.metadata.file_id, Some(35407));
        assert_eq!(skyui.metadata.archive_name.as_deref(), Some("SkyUI_5_2_SE.7z"));
        assert!(instance.mod_by_id("Visuals_separator").unwrap().is_separator());

        assert_eq!(instance.tools.len(), 2);
        assert_eq!(
            instance.tools[0].location,
            ToolLocation::InMod {
                mod_id: "xEdit".to_string(),
                relative: PathBuf::from("SSEEdit.exe"),
            }
        );
        assert_eq!(instance.tools[0].arguments, "-quickautoclean");
        assert_eq!(instance.tools[1].location, ToolLocation::External);
    }

    #[test]
    fn missing_instance_and_profile_are_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = ModOrganizer::with_global_root(tmp.path().join("global"));
        let err = manager
            .load_instance(&descriptor(&tmp.path().join("nope"), Mo2Options::default()))
            .unwrap_err();
        assert!(matches!(err, MigrationError::InstanceNotFound(_)));

        let root = tmp.path().join("inst");
        fixture(&root);
        let mut desc = descriptor(&root, Mo2Options::default());
        desc.profile = "Missing".to_string();
        assert!(matches!(
            manager.load_instance(&desc),
            Err(MigrationError::InstanceNotFound(_))
        ));
    }

    #[test]
    fn placement_rules_follow_instance_type() {
        let tmp = tempfile::tempdir().unwrap();
        let global = tmp.path().join("global");
        let manager = ModOrganizer::with_global_root(&global);
        let options = MigrationOptions::default();

        let outside = descriptor(
            &tmp.path().join("elsewhere"),
            Mo2Options {
                instance_type: Mo2InstanceType::Global,
                ..Mo2Options::default()
            },
        );
        assert!(matches!(
            manager.prepare_destination(&outside, &options),
            Err(MigrationError::InvalidDestinationPath(_))
        ));

        let install_global = descriptor(
            &global.join("Skyrim"),
            Mo2Options {
                instance_type: Mo2InstanceType::Global,
                install_mo2: true,
                ..Mo2Options::default()
            },
        );
        assert!(matches!(
            manager.prepare_destination(&install_global, &options),
            Err(MigrationError::InvalidDestinationPath(_))
        ));

        let portable = descriptor(&tmp.path().join("portable"), Mo2Options::default());
        assert!(manager.prepare_destination(&portable, &options).is_ok());
        write(&global.join("Existing").join(INI_FILE), "[General]\ngameName=Skyrim Special Edition\n");
        assert_eq!(scan_global_instances(&global).unwrap().len(), 1);
        assert!(matches!(
            manager.prepare_destination(&portable, &options),
            Err(MigrationError::InvalidDestinationPath(_))
        ));
        assert!(!tmp.path().join("portable").exists());
    }

    #[test]
    fn root_files_without_root_builder_have_no_record() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = ModOrganizer::with_global_root(tmp.path().join("global"));
        let options = MigrationOptions::default();
        let desc = descriptor(
            &tmp.path().join("dst"),
            Mo2Options {
                use_root_builder: false,
                ..Mo2Options::default()
            },
        );
        let dest = manager.prepare_destination(&desc, &options).unwrap();
        let source = Mod::new("enb", "ENB: Series", PathBuf::from("/src/enb"));

        let only_root = BTreeSet::from([FileScope::Root]);
        let placement = manager.place_mod(&dest, &source, &only_root, &options).unwrap();
        assert!(placement.records.is_empty());
        assert_eq!(placement.root_root, tmp.path().join("dst/game"));

        let both = BTreeSet::from([FileScope::Data, FileScope::Root]);
        let placement = manager.place_mod(&dest, &source, &both, &options).unwrap();
        assert_eq!(placement.records[0].id, "ENB Series");
        assert_eq!(placement.data_root, tmp.path().join("dst/mods/ENB Series"));
    }

    #[test]
    fn write_instance_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = ModOrganizer::with_global_root(tmp.path().join("global"));
        let options = MigrationOptions::default();
        let desc = descriptor(&tmp.path().join("dst"), Mo2Options::default());
        let mut dest = manager.prepare_destination(&desc, &options).unwrap();
        manager
            .create_layout(&dest, &options, &ProgressReporter::default())
            .unwrap();

        let mut source = Mod::new("a", "Mod A", PathBuf::from("/src/a"));
        source.version = Some("1.1".to_string());
        source.metadata.nexus_mod_id = Some(42);
        let placement = manager
            .place_mod(&dest, &source, &BTreeSet::from([FileScope::Data]), &options)
            .unwrap();
        fs::create_dir_all(&placement.data_root).unwrap();
        manager.register_mods(&mut dest, placement.records);
        let tools = vec![Tool {
            name: "LOOT".to_string(),
            executable: PathBuf::from("/games/loot/loot.exe"),
            arguments: "--game=\"Skyrim Special Edition\"".to_string(),
            working_dir: None,
            location: ToolLocation::External,
            included: true,
        }];

        manager.write_instance(&dest, &[], &tools).unwrap();
        let first_ini = fs::read(dest.root.join(INI_FILE)).unwrap();
        let first_list = fs::read_to_string(dest.profile_dir.join(MODLIST_FILE)).unwrap();
        manager.write_instance(&dest, &[], &tools).unwrap();
        assert_eq!(fs::read(dest.root.join(INI_FILE)).unwrap(), first_ini);
        assert_eq!(
            fs::read_to_string(dest.profile_dir.join(MODLIST_FILE)).unwrap(),
            first_list
        );
        assert!(first_list.ends_with("+Mod A\n"));

        let reread = manager.load_instance(&desc).unwrap();
        assert_eq!(reread.tools.len(), 1);
        assert_eq!(reread.tools[0].name, "LOOT");
        let mod_a = reread.mod_by_id("Mod A").unwrap();
        assert_eq!(mod_a.metadata.nexus_mod_id, Some(42));
        assert_eq!(mod_a.version.as_deref(), Some("1.1"));
    }

    #[test]
    fn value_decoding() {
        assert_eq!(decode_value("@ByteArray(C:\\\\Games\\\\Skyrim)"), "C:\\Games\\Skyrim");
        assert_eq!(decode_value("\"-a \\\"b\\\"\""), "-a \"b\"");
        assert_eq!(trim_version("1.0"), "1.0");
        assert_eq!(trim_version("1.0.0"), "1.0");
        assert_eq!(trim_version("2.1.0.0"), "2.1");
    }
}
