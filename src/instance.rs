use crate::{game::GameId, manager::ManagerOptions, paths, report::Advisory};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerKind {
    ModOrganizer,
    Vortex,
}

impl ManagerKind {
    pub fn label(self) -> &'static str {
        match self {
            ManagerKind::ModOrganizer => "Mod Organizer 2",
            ManagerKind::Vortex => "Vortex",
        }
    }
}

impl fmt::Display for ManagerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModKind {
    Regular,
    Separator,
    Overwrite,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModMetadata {
    pub nexus_mod_id: Option<u64>,
    pub file_id: Option<u64>,
    pub archive_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mod {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub priority: usize,
    pub enabled: bool,
    pub size: u64,
    pub version: Option<String>,
    pub kind: ModKind,
    #[serde(default)]
    pub metadata: ModMetadata,
    #[serde(default)]
    pub deploy_type: Option<String>,
}

impl Mod {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path,
            priority: 0,
            enabled: true,
            size: 0,
            version: None,
            kind: ModKind::Regular,
            metadata: ModMetadata::default(),
            deploy_type: None,
        }
    }

    pub fn is_separator(&self) -> bool {
        self.kind == ModKind::Separator
    }

    pub fn is_overwrite(&self) -> bool {
        self.kind == ModKind::Overwrite
    }

    pub fn participates(&self) -> bool {
        self.enabled && !self.is_separator()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileScope {
    Data,
    Root,
}

impl FileScope {
    pub fn label(self) -> &'static str {
        match self {
            FileScope::Data => "data",
            FileScope::Root => "root",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub relative_path: PathBuf,
    pub scope: FileScope,
    pub source: PathBuf,
    pub owner: usize,
    pub owner_id: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolLocation {
    InMod { mod_id: String, relative: PathBuf },
    InGameDir { relative: PathBuf },
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub executable: PathBuf,
    pub arguments: String,
    pub working_dir: Option<PathBuf>,
    pub location: ToolLocation,
    pub included: bool,
}

impl Tool {
    pub fn owner(&self) -> Option<&str> {
        match &self.location {
            ToolLocation::InMod { mod_id, .. } => Some(mod_id.as_str()),
            _ => None,
        }
    }
}

pub fn locate_tool(executable: &Path, mods: &[Mod], game_dir: &Path) -> ToolLocation {
    for entry in mods {
        if entry.path.as_os_str().is_empty() {
            continue;
        }
        if let Some(relative) = paths::relative_to(executable, &entry.path) {
            return ToolLocation::InMod {
                mod_id: entry.id.clone(),
                relative,
            };
        }
    }
    if !game_dir.as_os_str().is_empty() {
        if let Some(relative) = paths::relative_to(executable, game_dir) {
            return ToolLocation::InGameDir { relative };
        }
    }
    ToolLocation::External
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub kind: ManagerKind,
    pub name: String,
    pub game: GameId,
    pub game_dir: PathBuf,
    pub root: PathBuf,
    pub profile: String,
    pub mods_dir: PathBuf,
    pub profile_dir: PathBuf,
    // Ascending priority.
    pub mods: Vec<Mod>,
    pub tools: Vec<Tool>,
    pub separate_ini_files: bool,
    pub separate_saves: bool,
    pub exists: bool,
    pub options: ManagerOptions,
    pub advisories: Vec<Advisory>,
}

impl Instance {
    pub fn mod_by_id(&self, id: &str) -> Option<&Mod> {
        self.mods.iter().find(|entry| entry.id == id)
    }

    pub fn enabled_mods(&self) -> impl Iterator<Item = &Mod> {
        self.mods.iter().filter(|entry| entry.enabled)
    }

    pub fn sort_by_priority(&mut self) {
        self.mods.sort_by_key(|entry| entry.priority);
    }

    pub fn next_priority(&self) -> usize {
        self.mods
            .iter()
            .map(|entry| entry.priority + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn duplicate_priority(&self) -> Option<usize> {
        let mut seen = HashSet::new();
        self.mods
            .iter()
            .map(|entry| entry.priority)
            .find(|priority| !seen.insert(*priority))
    }
}

pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}
