use crate::{
    error::{MigrationError, MigrationResult},
    game,
    instance::{locate_tool, FileEntry, FileScope, Instance, ManagerKind, Mod, ModKind, Tool},
    manager::{self, InstanceDescriptor, ModManager, ModPlacement},
    migrator::MigrationOptions,
    paths,
    progress::ProgressReporter,
    report::Advisory,
    transfer::sanitize_mod_name,
    vortex_state::{flatten, join_key, load_tree, LevelDbBackend, StateBackend, StateStore},
};
use anyhow::Context;
use serde_json::{json, Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

pub const DEPLOYMENT_FILE: &str = "vortex.deployment.msgpack";
pub const ROOT_DEPLOY_TYPE: &str = "dinput";
const MANAGED_MARKER: &str = "__folder_managed_by_vortex";
const DEFAULT_PROFILE_NAME: &str = "Migrated";

pub struct Vortex {
    backend: Box<dyn StateBackend>,
}

impl Vortex {
    pub fn new(app_dir: &Path) -> Self {
        Self {
            backend: Box::new(LevelDbBackend::new(app_dir)),
        }
    }

    pub fn with_backend(backend: impl StateBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    fn read_instance(
        &self,
        store: &mut dyn StateStore,
        descriptor: &InstanceDescriptor,
        profile_id: &str,
        profile: &Value,
    ) -> MigrationResult<Instance> {
        let game_id = descriptor.game.vortex_id();
        let app_dir = &descriptor.root;
        let staging = staging_folder(store, descriptor)?;
        let game_dir = discovered_game_path(store, game_id)?
            .or_else(|| descriptor.game_dir.clone())
            .or_else(|| game::detect_install_dir(descriptor.game).ok())
            .unwrap_or_default();

        let tree = load_tree(store, &join_key(&["persistent", "mods", game_id]))?;
        let mut installed = Vec::new();
        if let Some(records) = tree.as_object() {
            for (id, data) in records {
                if let Some(entry) = parse_mod(id, data, &staging, profile) {
                    installed.push((entry, parse_rules(data)));
                }
            }
        }
        let order = deployment_order(&installed);
        let mut mods: Vec<Mod> = Vec::with_capacity(order.len());
        for (priority, index) in order.into_iter().enumerate() {
            let mut entry = installed[index].0.clone();
            entry.priority = priority;
            mods.push(entry);
        }

        let tools = read_tools(store, game_id, &mods, &game_dir)?;
        let features = &profile["features"];
        let name = profile["name"]
            .as_str()
            .unwrap_or(profile_id)
            .to_string();
        debug!(mods = mods.len(), tools = tools.len(), profile = %name, "read Vortex profile");

        Ok(Instance {
            kind: ManagerKind::Vortex,
            name,
            game: descriptor.game,
            game_dir,
            root: app_dir.clone(),
            profile: profile_id.to_string(),
            mods_dir: staging,
            profile_dir: profile_dir(app_dir, game_id, profile_id),
            mods,
            tools,
            separate_ini_files: features["local_game_settings"].as_bool().unwrap_or(false),
            separate_saves: features["local_saves"].as_bool().unwrap_or(false),
            exists: true,
            options: descriptor.options.clone(),
            advisories: Vec::new(),
        })
    }
}

impl ModManager for Vortex {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Vortex
    }

    fn load_instance(&self, descriptor: &InstanceDescriptor) -> MigrationResult<Instance> {
        let mut store = self.backend.open()?;
        let game_id = descriptor.game.vortex_id();
        let profiles = load_tree(store.as_mut(), &join_key(&["persistent", "profiles"]))?;
        let wanted = wanted_profile(store.as_mut(), descriptor)?;
        let Some((profile_id, profile)) = find_profile(&profiles, game_id, &wanted) else {
            return Err(MigrationError::InstanceNotFound(format!(
                "Vortex profile {wanted:?} for {game_id}"
            )));
        };
        let instance = self.read_instance(store.as_mut(), descriptor, &profile_id, profile)?;
        if instance.mods_dir.join(DEPLOYMENT_FILE).is_file() {
            return Err(MigrationError::DeploymentBlocked {
                staging: instance.mods_dir,
            });
        }
        Ok(instance)
    }

    fn prepare_destination(
        &self,
        descriptor: &InstanceDescriptor,
        _options: &MigrationOptions,
    ) -> MigrationResult<Instance> {
        let mut store = self.backend.open()?;
        let game_id = descriptor.game.vortex_id();
        if !descriptor.root.join(game_id).is_dir() {
            return Err(MigrationError::InvalidDestinationPath(format!(
                "{} is not managed by Vortex ({} is missing)",
                descriptor.game.display_name(),
                descriptor.root.join(game_id).display()
            )));
        }
        let Some(game_dir) = discovered_game_path(store.as_mut(), game_id)? else {
            return Err(MigrationError::InvalidDestinationPath(format!(
                "Vortex has not discovered {}",
                descriptor.game.display_name()
            )));
        };
        let profiles_visible = store
            .get(&join_key(&["settings", "interface", "profilesVisible"]))?
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .and_then(|value| value.as_bool())
            .unwrap_or(false);
        if !profiles_visible {
            return Err(MigrationError::InvalidDestinationPath(
                "profile management is disabled in Vortex".to_string(),
            ));
        }

        let profiles = load_tree(store.as_mut(), &join_key(&["persistent", "profiles"]))?;
        let wanted = wanted_profile(store.as_mut(), descriptor)?;
        if let Some((profile_id, profile)) = find_profile(&profiles, game_id, &wanted) {
            return self.read_instance(store.as_mut(), descriptor, &profile_id, profile);
        }

        let name = [&descriptor.profile, &descriptor.name]
            .into_iter()
            .find(|value| !value.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_PROFILE_NAME.to_string());
        let profile_id = generate_id(&[game_id, name.as_str()]);
        let staging = staging_folder(store.as_mut(), descriptor)?;
        Ok(Instance {
            kind: ManagerKind::Vortex,
            name,
            game: descriptor.game,
            game_dir,
            root: descriptor.root.clone(),
            profile_dir: profile_dir(&descriptor.root, game_id, &profile_id),
            profile: profile_id,
            mods_dir: staging,
            mods: Vec::new(),
            tools: Vec::new(),
            separate_ini_files: false,
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
        if let Some(backup) = self.backend.backup()? {
            info!(backup = %backup.display(), "Vortex state backed up");
        }
        fs::create_dir_all(&instance.mods_dir).context("create staging folder")?;
        let marker = instance.mods_dir.join(MANAGED_MARKER);
        if !marker.exists() {
            fs::write(&marker, "").context("mark staging folder")?;
        }
        fs::create_dir_all(&instance.profile_dir).context("create profile dir")?;
        if instance.exists {
            return Ok(());
        }

        let game_id = instance.game.vortex_id();
        let record = json!({
            "id": instance.profile,
            "gameId": game_id,
            "name": instance.name,
            "lastActivated": 0,
            "modState": {},
            "features": {
                "local_game_settings": instance.separate_ini_files,
                "local_saves": instance.separate_saves,
            },
        });
        let mut store = self.backend.open()?;
        store.write(&flatten(
            &join_key(&["persistent", "profiles", instance.profile.as_str()]),
            &record,
        ))?;
        info!(profile = %instance.name, "created Vortex profile");
        Ok(())
    }

    fn place_mod(
        &self,
        destination: &Instance,
        source: &Mod,
        scopes: &BTreeSet<FileScope>,
        options: &MigrationOptions,
    ) -> MigrationResult<ModPlacement> {
        match source.kind {
            ModKind::Overwrite => return Err(MigrationError::OverwriteUnsupported),
            ModKind::Separator => return Ok(ModPlacement::default()),
            ModKind::Regular => {}
        }

        let base = sanitize_mod_name(&source.name, options.modname_limit);
        let has_root = scopes.contains(&FileScope::Root);
        let has_data = scopes.contains(&FileScope::Data) || !has_root;
        let root_id = if has_data && has_root {
            format!("{base} (Root)")
        } else {
            base.clone()
        };
        let data_root = destination.mods_dir.join(&base);
        let root_root = destination.mods_dir.join(&root_id);

        let record = |id: &str, name: String, path: &Path, deploy_type: Option<String>| {
            let mut record = Mod::new(id, name, path.to_path_buf());
            record.enabled = source.enabled;
            record.version = source.version.clone();
            record.metadata = source.metadata.clone();
            record.size = source.size;
            record.deploy_type = deploy_type;
            record
        };
        let mut records = Vec::new();
        if has_data {
            records.push(record(&base, source.name.clone(), &data_root, None));
        }
        if has_root {
            let name = if has_data {
                format!("{} (Root)", source.name)
            } else {
                source.name.clone()
            };
            records.push(record(
                &root_id,
                name,
                &root_root,
                Some(ROOT_DEPLOY_TYPE.to_string()),
            ));
        }
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
        let mut store = self
            .backend
            .open()
            .map_err(|err| MigrationError::Write(anyhow::Error::new(err)))?;
        let mut write = || -> anyhow::Result<()> {
            let game_id = instance.game.vortex_id();
            let mods_prefix = join_key(&["persistent", "mods", game_id]);
            let known = load_tree(store.as_mut(), &mods_prefix)?;
            let profile_prefix = join_key(&["persistent", "profiles", instance.profile.as_str()]);
            let mut batch = Vec::new();

            for entry in instance.mods.iter().filter(|entry| entry.kind == ModKind::Regular) {
                if known.get(&entry.id).is_none() {
                    batch.extend(flatten(
                        &join_key(&[mods_prefix.as_str(), entry.id.as_str()]),
                        &mod_record(entry),
                    ));
                }
                batch.push((
                    join_key(&[profile_prefix.as_str(), "modState", entry.id.as_str(), "enabled"]),
                    Value::Bool(entry.enabled).to_string(),
                ));
            }

            let tools_prefix = join_key(&["settings", "gameMode", "discovered", game_id, "tools"]);
            for tool in tools {
                let id = tool_id(&tool.name);
                batch.extend(flatten(
                    &join_key(&[tools_prefix.as_str(), id.as_str()]),
                    &tool_record(&id, tool),
                ));
            }

            batch.push((
                join_key(&[profile_prefix.as_str(), "features", "local_game_settings"]),
                Value::Bool(instance.separate_ini_files).to_string(),
            ));
            batch.push((
                join_key(&[profile_prefix.as_str(), "features", "local_saves"]),
                Value::Bool(instance.separate_saves).to_string(),
            ));

            store.write(&batch)?;
            manager::write_manifest(instance, entries)?;
            debug!(keys = batch.len(), "wrote Vortex state");
            Ok(())
        };
        write().map_err(MigrationError::Write)
    }

    fn activate(&self, instance: &Instance) -> MigrationResult<()> {
        let mut store = self.backend.open()?;
        let profile = Value::String(instance.profile.clone()).to_string();
        store.write(&[
            (
                join_key(&["settings", "profiles", "activeProfileId"]),
                profile.clone(),
            ),
            (
                join_key(&[
                    "settings",
                    "profiles",
                    "lastActiveProfile",
                    instance.game.vortex_id(),
                ]),
                profile,
            ),
        ])?;
        Ok(())
    }

    fn advisories(&self, instance: &Instance, _entries: &[FileEntry]) -> Vec<Advisory> {
        let mut out = instance.advisories.clone();
        if instance.mods_dir.join(DEPLOYMENT_FILE).is_file() {
            out.push(Advisory::PurgeDeployment {
                staging: instance.mods_dir.clone(),
            });
        }
        out
    }
}

fn profile_dir(app_dir: &Path, game_id: &str, profile_id: &str) -> PathBuf {
    app_dir.join(game_id).join("profiles").join(profile_id)
}

fn wanted_profile(store: &mut dyn StateStore, descriptor: &InstanceDescriptor) -> anyhow::Result<String> {
    if !descriptor.profile.is_empty() {
        return Ok(descriptor.profile.clone());
    }
    let key = join_key(&[
        "settings",
        "profiles",
        "lastActiveProfile",
        descriptor.game.vortex_id(),
    ]);
    Ok(store
        .get(&key)?
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default())
}

fn find_profile<'a>(profiles: &'a Value, game_id: &str, wanted: &str) -> Option<(String, &'a Value)> {
    let records = profiles.as_object()?;
    let for_game = |profile: &Value| profile["gameId"].as_str() == Some(game_id);
    if let Some(profile) = records.get(wanted).filter(|profile| for_game(profile)) {
        return Some((wanted.to_string(), profile));
    }
    records
        .iter()
        .filter(|(_, profile)| for_game(profile))
        .find(|(_, profile)| {
            profile["name"]
                .as_str()
                .map(|name| name.eq_ignore_ascii_case(wanted))
                .unwrap_or(false)
        })
        .map(|(id, profile)| (id.clone(), profile))
}

fn staging_folder(store: &mut dyn StateStore, descriptor: &InstanceDescriptor) -> anyhow::Result<PathBuf> {
    if let Some(folder) = descriptor
        .options
        .vortex()
        .and_then(|options| options.staging_folder.clone())
    {
        return Ok(folder);
    }
    let game_id = descriptor.game.vortex_id();
    let raw = store
        .get(&join_key(&["settings", "mods", "installPath", game_id]))?
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|value| value.as_str().map(str::to_string))
        .filter(|value| !value.is_empty());
    Ok(match raw {
        Some(raw) => paths::resolve_placeholders(
            &raw,
            &[("game", Path::new(game_id)), ("USERDATA", &descriptor.root)],
        ),
        None => descriptor.root.join(game_id).join("mods"),
    })
}

fn discovered_game_path(store: &mut dyn StateStore, game_id: &str) -> anyhow::Result<Option<PathBuf>> {
    Ok(store
        .get(&join_key(&["settings", "gameMode", "discovered", game_id, "path"]))?
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|value| value.as_str().map(PathBuf::from))
        .filter(|path| !path.as_os_str().is_empty()))
}

fn parse_mod(id: &str, data: &Value, staging: &Path, profile: &Value) -> Option<Mod> {
    let kind = data["type"].as_str().unwrap_or_default();
    if kind == "collection" {
        return None;
    }
    let install = data["installationPath"].as_str().unwrap_or(id);
    let path = staging.join(install);
    if !path.is_dir() {
        warn!(mod_id = %id, path = %path.display(), "installed mod is missing from the staging folder");
        return None;
    }
    let attributes = &data["attributes"];
    let name = ["customFileName", "logicalFileName", "modName", "name"]
        .iter()
        .filter_map(|key| attributes[*key].as_str())
        .find(|value| !value.is_empty())
        .unwrap_or(id);

    let mut entry = Mod::new(id, name, path);
    entry.enabled = profile["modState"][id]["enabled"].as_bool().unwrap_or(false);
    entry.version = attributes["version"]
        .as_str()
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    entry.metadata.nexus_mod_id = number(&attributes["modId"]);
    entry.metadata.file_id = number(&attributes["fileId"]);
    entry.metadata.archive_name = attributes["fileName"]
        .as_str()
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    entry.deploy_type = Some(kind)
        .filter(|kind| !kind.is_empty())
        .map(str::to_string);
    entry.size = crate::instance::dir_size(&entry.path);
    Some(entry)
}

fn number(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|raw| raw.parse().ok()))
        .filter(|id| *id > 0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RuleKind {
    Before,
    After,
}

#[derive(Debug, Clone)]
struct Rule {
    kind: RuleKind,
    reference: Value,
}

fn parse_rules(data: &Value) -> Vec<Rule> {
    data["rules"]
        .as_array()
        .map(|rules| {
            rules
                .iter()
                .filter_map(|rule| {
                    let kind = match rule["type"].as_str()? {
                        "before" => RuleKind::Before,
                        "after" => RuleKind::After,
                        _ => return None,
                    };
                    Some(Rule {
                        kind,
                        reference: rule["reference"].clone(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn reference_matches(reference: &Value, entry: &Mod) -> bool {
    if let Some(id) = reference["id"].as_str() {
        return id == entry.id;
    }
    let archive_stem = entry
        .metadata
        .archive_name
        .as_deref()
        .map(|name| Path::new(name).file_stem().map(|stem| stem.to_string_lossy().to_string()))
        .unwrap_or_default();
    if let Some(logical) = reference["logicalFileName"].as_str() {
        return logical.eq_ignore_ascii_case(&entry.name);
    }
    if let Some(expression) = reference["fileExpression"].as_str() {
        return archive_stem
            .as_deref()
            .map(|stem| stem.eq_ignore_ascii_case(expression))
            .unwrap_or(false)
            || expression.eq_ignore_ascii_case(&entry.id);
    }
    false
}

/// Stable topological sort of `before`/`after` rules over name order.
/// Returns indices in ascending priority; cycles are broken at the
/// alphabetically first remaining mod.
fn deployment_order(installed: &[(Mod, Vec<Rule>)]) -> Vec<usize> {
    let mut by_name: Vec<usize> = (0..installed.len()).collect();
    by_name.sort_by(|a, b| {
        let (left, right) = (&installed[*a].0, &installed[*b].0);
        left.name
            .to_lowercase()
            .cmp(&right.name.to_lowercase())
            .then_with(|| left.id.cmp(&right.id))
    });
    let rank: BTreeMap<usize, usize> = by_name
        .iter()
        .enumerate()
        .map(|(rank, index)| (*index, rank))
        .collect();

    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); installed.len()];
    for (index, (_, rules)) in installed.iter().enumerate() {
        for rule in rules {
            for (other, (candidate, _)) in installed.iter().enumerate() {
                if other == index || !reference_matches(&rule.reference, candidate) {
                    continue;
                }
                match rule.kind {
                    RuleKind::Before => successors[index].insert(other),
                    RuleKind::After => successors[other].insert(index),
                };
            }
        }
    }
    let mut indegree = vec![0usize; installed.len()];
    for edges in &successors {
        for next in edges {
            indegree[*next] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..installed.len())
        .filter(|index| indegree[*index] == 0)
        .map(|index| rank[&index])
        .collect();
    let mut placed = vec![false; installed.len()];
    let mut order = Vec::with_capacity(installed.len());
    while order.len() < installed.len() {
        let next_rank = match ready.iter().next().copied() {
            Some(next_rank) => next_rank,
            None => {
                let Some(stuck) = by_name.iter().find(|index| !placed[**index]) else {
                    break;
                };
                warn!(mod_id = %installed[*stuck].0.id, "mod rules form a cycle; breaking it");
                rank[stuck]
            }
        };
        ready.remove(&next_rank);
        let index = by_name[next_rank];
        if placed[index] {
            continue;
        }
        placed[index] = true;
        order.push(index);
        for next in &successors[index] {
            indegree[*next] = indegree[*next].saturating_sub(1);
            if indegree[*next] == 0 && !placed[*next] {
                ready.insert(rank[next]);
            }
        }
    }
    order
}

fn read_tools(
    store: &mut dyn StateStore,
    game_id: &str,
    mods: &[Mod],
    game_dir: &Path,
) -> anyhow::Result<Vec<Tool>> {
    let tree = load_tree(
        store,
        &join_key(&["settings", "gameMode", "discovered", game_id, "tools"]),
    )?;
    let mut tools = Vec::new();
    let Some(records) = tree.as_object() else {
        return Ok(tools);
    };
    for (id, data) in records {
        let Some(path) = data["path"].as_str().filter(|path| !path.is_empty()) else {
            continue;
        };
        let executable = PathBuf::from(path);
        let arguments = match &data["parameters"] {
            Value::Array(items) => join_arguments(items.iter().filter_map(Value::as_str)),
            Value::String(raw) => raw.clone(),
            _ => String::new(),
        };
        tools.push(Tool {
            name: data["name"].as_str().unwrap_or(id).to_string(),
            location: locate_tool(&executable, mods, game_dir),
            executable,
            arguments,
            working_dir: data["workingDirectory"]
                .as_str()
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            included: !data["hidden"].as_bool().unwrap_or(false),
        });
    }
    Ok(tools)
}

fn join_arguments<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items
        .map(|item| {
            if item.contains(char::is_whitespace) && !item.starts_with('"') {
                format!("\"{item}\"")
            } else {
                item.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn split_arguments(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut started = false;
    for ch in raw.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                started = true;
            }
            ch if ch.is_whitespace() && !quoted => {
                if started {
                    out.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            ch => {
                current.push(ch);
                started = true;
            }
        }
    }
    if started {
        out.push(current);
    }
    out
}

fn mod_record(entry: &Mod) -> Value {
    let folder = entry
        .path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| entry.id.clone());
    let mut attributes = Map::new();
    attributes.insert("name".into(), json!(entry.name));
    attributes.insert("customFileName".into(), json!(entry.name));
    attributes.insert("logicalFileName".into(), json!(entry.name));
    if let Some(version) = &entry.version {
        attributes.insert("version".into(), json!(version));
    }
    if let Some(mod_id) = entry.metadata.nexus_mod_id {
        attributes.insert("modId".into(), json!(mod_id));
    }
    if let Some(file_id) = entry.metadata.file_id {
        attributes.insert("fileId".into(), json!(file_id));
    }
    if let Some(file_name) = &entry.metadata.archive_name {
        attributes.insert("fileName".into(), json!(file_name));
    }
    json!({
        "id": entry.id,
        "state": "installed",
        "type": entry.deploy_type.clone().unwrap_or_default(),
        "installationPath": folder,
        "attributes": attributes,
    })
}

fn tool_record(id: &str, tool: &Tool) -> Value {
    json!({
        "id": id,
        "name": tool.name,
        "path": tool.executable.to_string_lossy(),
        "parameters": split_arguments(&tool.arguments),
        "workingDirectory": tool
            .working_dir
            .as_deref()
            .map(|dir| dir.to_string_lossy().to_string())
            .unwrap_or_default(),
        "requiredFiles": [],
        "custom": true,
        "shell": false,
        "detach": true,
        "exclusive": false,
    })
}

pub fn tool_id(name: &str) -> String {
    format!("migrated-{}", generate_id(&[name]))
}

fn generate_id(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex()[..9].to_string()
}
