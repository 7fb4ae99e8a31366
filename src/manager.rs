use crate::{
    error::{MigrationError, MigrationResult},
    game::GameId,
    instance::{FileEntry, FileScope, Instance, ManagerKind, Mod, Tool, ToolLocation},
    migrator::MigrationOptions,
    modorganizer::ModOrganizer,
    progress::ProgressReporter,
    report::Advisory,
    vortex::Vortex,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

pub const MANIFEST_FILE: &str = "migration_manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mo2InstanceType {
    Portable,
    Global,
}

#[derive(Debug, Clone)]
pub struct Mo2Options {
    pub instance_type: Mo2InstanceType,
    pub use_root_builder: bool,
    pub install_mo2: bool,
    pub mods_folder: Option<PathBuf>,
    pub profiles_folder: Option<PathBuf>,
}

impl Default for Mo2Options {
    fn default() -> Self {
        Self {
            instance_type: Mo2InstanceType::Portable,
            use_root_builder: true,
            install_mo2: false,
            mods_folder: None,
            profiles_folder: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VortexOptions {
    pub staging_folder: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum ManagerOptions {
    ModOrganizer(Mo2Options),
    Vortex(VortexOptions),
}

impl ManagerOptions {
    pub fn kind(&self) -> ManagerKind {
        match self {
            ManagerOptions::ModOrganizer(_) => ManagerKind::ModOrganizer,
            ManagerOptions::Vortex(_) => ManagerKind::Vortex,
        }
    }

    pub fn mo2(&self) -> Option<&Mo2Options> {
        match self {
            ManagerOptions::ModOrganizer(options) => Some(options),
            ManagerOptions::Vortex(_) => None,
        }
    }

    pub fn vortex(&self) -> Option<&VortexOptions> {
        match self {
            ManagerOptions::Vortex(options) => Some(options),
            ManagerOptions::ModOrganizer(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceDescriptor {
    pub name: String,
    pub game: GameId,
    pub root: PathBuf,
    pub profile: String,
    pub game_dir: Option<PathBuf>,
    pub options: ManagerOptions,
}

impl InstanceDescriptor {
    pub fn kind(&self) -> ManagerKind {
        self.options.kind()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModPlacement {
    pub data_root: PathBuf,
    pub root_root: PathBuf,
    pub records: Vec<Mod>,
}

impl ModPlacement {
    pub fn target(&self, scope: FileScope) -> &Path {
        match scope {
            FileScope::Data => &self.data_root,
            FileScope::Root => &self.root_root,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data_root.as_os_str().is_empty() && self.root_root.as_os_str().is_empty()
    }
}

pub trait ModManager: Send + Sync {
    fn kind(&self) -> ManagerKind;

    /// Reads an instance without touching anything on disk.
    fn load_instance(&self, descriptor: &InstanceDescriptor) -> MigrationResult<Instance>;

    fn list_mods<'a>(&self, instance: &'a Instance) -> Vec<&'a Mod> {
        let mut mods: Vec<&Mod> = instance.mods.iter().collect();
        mods.sort_by_key(|entry| entry.priority);
        mods
    }

    fn list_tools<'a>(&self, instance: &'a Instance) -> Vec<&'a Tool> {
        instance.tools.iter().collect()
    }

    /// Opens an existing destination or plans a new one. Validation only;
    /// nothing is written until `create_layout`.
    fn prepare_destination(
        &self,
        descriptor: &InstanceDescriptor,
        options: &MigrationOptions,
    ) -> MigrationResult<Instance>;

    fn create_layout(
        &self,
        instance: &Instance,
        options: &MigrationOptions,
        progress: &ProgressReporter,
    ) -> MigrationResult<()>;

    fn install_manager(
        &self,
        instance: &Instance,
        options: &MigrationOptions,
        progress: &ProgressReporter,
    ) -> MigrationResult<()> {
        let _ = (instance, options, progress);
        Ok(())
    }

    fn place_mod(
        &self,
        destination: &Instance,
        source: &Mod,
        scopes: &BTreeSet<FileScope>,
        options: &MigrationOptions,
    ) -> MigrationResult<ModPlacement>;

    fn place_tool(
        &self,
        destination: &Instance,
        tool: &Tool,
        source_mod: Option<&Mod>,
        placement: Option<&ModPlacement>,
    ) -> MigrationResult<Tool> {
        map_tool(destination, tool, source_mod, placement)
    }

    fn register_mods(&self, destination: &mut Instance, records: Vec<Mod>) {
        for mut record in records {
            if let Some(existing) = destination
                .mods
                .iter_mut()
                .find(|entry| entry.id == record.id)
            {
                record.priority = existing.priority;
                *existing = record;
                continue;
            }
            record.priority = destination.next_priority();
            destination.mods.push(record);
        }
    }

    fn ini_dir(&self, instance: &Instance) -> MigrationResult<PathBuf>;

    fn additional_files_dir(&self, instance: &Instance) -> PathBuf {
        instance.profile_dir.clone()
    }

    /// Persists native metadata. Identical input yields identical output.
    fn write_instance(
        &self,
        instance: &Instance,
        entries: &[FileEntry],
        tools: &[Tool],
    ) -> MigrationResult<()>;

    fn activate(&self, instance: &Instance) -> MigrationResult<()>;

    fn advisories(&self, instance: &Instance, entries: &[FileEntry]) -> Vec<Advisory> {
        let _ = (instance, entries);
        Vec::new()
    }
}

pub fn manager_for(descriptor: &InstanceDescriptor) -> MigrationResult<Box<dyn ModManager>> {
    Ok(match descriptor.kind() {
        ManagerKind::ModOrganizer => Box::new(ModOrganizer::new()?),
        ManagerKind::Vortex => Box::new(Vortex::new(&descriptor.root)),
    })
}

fn map_tool(
    destination: &Instance,
    tool: &Tool,
    source_mod: Option<&Mod>,
    placement: Option<&ModPlacement>,
) -> MigrationResult<Tool> {
    let (executable, location) = match &tool.location {
        ToolLocation::External => {
            return Err(MigrationError::ToolOutsideInstance {
                name: tool.name.clone(),
                path: tool.executable.clone(),
            })
        }
        ToolLocation::InGameDir { relative } => (
            destination.game_dir.join(relative),
            tool.location.clone(),
        ),
        ToolLocation::InMod { mod_id, relative } => {
            let placement = placement
                .filter(|placement| !placement.is_empty())
                .with_context(|| format!("owning mod {mod_id} was not migrated"))?;
            let (scope, rest) = split_root_prefix(relative);
            let executable = placement.target(scope).join(rest);
            let location = match placement.records.first() {
                Some(record) => ToolLocation::InMod {
                    mod_id: record.id.clone(),
                    relative: executable
                        .strip_prefix(&record.path)
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|_| rest.to_path_buf()),
                },
                None => ToolLocation::InGameDir {
                    relative: rest.to_path_buf(),
                },
            };
            (executable, location)
        }
    };

    let old_parent = tool.executable.parent();
    let working_dir = match (&tool.working_dir, old_parent) {
        (Some(dir), Some(parent)) if dir == parent => executable.parent().map(Path::to_path_buf),
        (Some(dir), _) => match source_mod {
            Some(entry) => match dir.strip_prefix(&entry.path) {
                Ok(rest) => {
                    let (scope, rest) = split_root_prefix(rest);
                    placement.map(|placement| placement.target(scope).join(rest))
                }
                Err(_) => Some(dir.clone()),
            },
            None => Some(dir.clone()),
        },
        (None, _) => None,
    };

    Ok(Tool {
        name: tool.name.clone(),
        executable,
        arguments: tool.arguments.clone(),
        working_dir,
        location,
        included: true,
    })
}

pub fn split_root_prefix(relative: &Path) -> (FileScope, &Path) {
    let mut components = relative.components();
    if let Some(first) = components.next() {
        if first
            .as_os_str()
            .to_string_lossy()
            .eq_ignore_ascii_case(crate::conflicts::ROOT_FOLDER)
        {
            return (FileScope::Root, components.as_path());
        }
    }
    (FileScope::Data, relative)
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct ManifestEntry {
    source_mod: String,
    scope: FileScope,
    path: String,
    size: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MigrationManifest {
    instance: String,
    profile: String,
    files: Vec<ManifestEntry>,
}

pub fn write_manifest(instance: &Instance, entries: &[FileEntry]) -> anyhow::Result<()> {
    let mut files: Vec<ManifestEntry> = entries
        .iter()
        .map(|entry| ManifestEntry {
            source_mod: entry.owner_id.clone(),
            scope: entry.scope,
            path: entry.relative_path.to_string_lossy().replace('\\', "/"),
            size: entry.size,
        })
        .collect();
    files.sort_by(|a, b| {
        a.source_mod
            .cmp(&b.source_mod)
            .then_with(|| a.scope.cmp(&b.scope))
            .then_with(|| a.path.cmp(&b.path))
    });
    let manifest = MigrationManifest {
        instance: instance.name.clone(),
        profile: instance.profile.clone(),
        files,
    };
    fs::create_dir_all(&instance.mods_dir).context("create mods dir")?;
    let raw = serde_json::to_string_pretty(&manifest).context("serialize manifest")?;
    write_atomic_text(&instance.mods_dir.join(MANIFEST_FILE), &raw)
}

pub fn write_atomic_text(path: &Path, contents: &str) -> anyhow::Result<()> {
    let parent = path.parent().context("file has no parent")?;
    fs::create_dir_all(parent).with_context(|| format!("create dir {:?}", parent))?;
    let file_name = path.file_name().context("file name")?;
    let mut temp_name = std::ffi::OsString::from(file_name);
    temp_name.push(".tmp");
    let temp_path = parent.join(temp_name);
    fs::write(&temp_path, contents).with_context(|| format!("write {:?}", temp_path))?;
    fs::rename(&temp_path, path).with_context(|| format!("finalize {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_prefix_is_split_case_insensitively() {
        let (scope, rest) = split_root_prefix(Path::new("root/skse64_loader.exe"));
        assert_eq!(scope, FileScope::Root);
        assert_eq!(rest, Path::new("skse64_loader.exe"));
        let (scope, rest) = split_root_prefix(Path::new("Edit Scripts/x.pas"));
        assert_eq!(scope, FileScope::Data);
        assert_eq!(rest, Path::new("Edit Scripts/x.pas"));
    }

    #[test]
    fn placement_targets_follow_scope() {
        let placement = ModPlacement {
            data_root: PathBuf::from("/dst/mods/A"),
            root_root: PathBuf::from("/dst/mods/A/Root"),
            records: Vec::new(),
        };
        assert_eq!(placement.target(FileScope::Data), Path::new("/dst/mods/A"));
        assert_eq!(placement.target(FileScope::Root), Path::new("/dst/mods/A/Root"));
        assert!(ModPlacement::default().is_empty());
    }
}
