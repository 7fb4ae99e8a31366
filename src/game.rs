use anyhow::{bail, Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameId {
    SkyrimSe,
    Skyrim,
    EnderalSe,
    Fallout4,
    FalloutNv,
    Fallout3,
    Oblivion,
}

impl Default for GameId {
    fn default() -> Self {
        GameId::SkyrimSe
    }
}

impl GameId {
    pub fn display_name(self) -> &'static str {
        match self {
            GameId::SkyrimSe => "Skyrim Special Edition",
            GameId::Skyrim => "Skyrim",
            GameId::EnderalSe => "Enderal Special Edition",
            GameId::Fallout4 => "Fallout 4",
            GameId::FalloutNv => "Fallout New Vegas",
            GameId::Fallout3 => "Fallout 3",
            GameId::Oblivion => "Oblivion",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GameId::SkyrimSe => "skyrimse",
            GameId::Skyrim => "skyrim",
            GameId::EnderalSe => "enderalse",
            GameId::Fallout4 => "fallout4",
            GameId::FalloutNv => "falloutnv",
            GameId::Fallout3 => "fallout3",
            GameId::Oblivion => "oblivion",
        }
    }

    pub fn vortex_id(self) -> &'static str {
        match self {
            GameId::EnderalSe => "enderalspecialedition",
            other => other.as_str(),
        }
    }

    pub fn mo2_name(self) -> &'static str {
        match self {
            GameId::SkyrimSe => "Skyrim Special Edition",
            GameId::Skyrim => "Skyrim",
            GameId::EnderalSe => "Enderal Special Edition",
            GameId::Fallout4 => "Fallout 4",
            GameId::FalloutNv => "New Vegas",
            GameId::Fallout3 => "Fallout 3",
            GameId::Oblivion => "Oblivion",
        }
    }

    pub fn nexus_id(self) -> &'static str {
        match self {
            GameId::SkyrimSe => "skyrimspecialedition",
            GameId::Skyrim => "skyrim",
            GameId::EnderalSe => "enderalspecialedition",
            GameId::Fallout4 => "fallout4",
            GameId::FalloutNv => "newvegas",
            GameId::Fallout3 => "fallout3",
            GameId::Oblivion => "oblivion",
        }
    }

    pub fn ini_folder(self) -> &'static str {
        match self {
            GameId::SkyrimSe => "Skyrim Special Edition",
            GameId::Skyrim => "Skyrim",
            GameId::EnderalSe => "Enderal Special Edition",
            GameId::Fallout4 => "Fallout4",
            GameId::FalloutNv => "FalloutNV",
            GameId::Fallout3 => "Fallout3",
            GameId::Oblivion => "Oblivion",
        }
    }

    pub fn ini_files(self) -> &'static [&'static str] {
        match self {
            GameId::SkyrimSe | GameId::Skyrim => &["Skyrim.ini", "SkyrimPrefs.ini", "SkyrimCustom.ini"],
            GameId::EnderalSe => &["Enderal.ini", "EnderalPrefs.ini"],
            GameId::Fallout4 => &["Fallout4.ini", "Fallout4Prefs.ini", "Fallout4Custom.ini"],
            GameId::FalloutNv | GameId::Fallout3 => &["Fallout.ini", "FalloutPrefs.ini", "FalloutCustom.ini"],
            GameId::Oblivion => &["Oblivion.ini"],
        }
    }

    pub fn additional_files(self) -> &'static [&'static str] {
        match self {
            GameId::Oblivion | GameId::Fallout3 | GameId::FalloutNv => &["plugins.txt"],
            _ => &["plugins.txt", "loadorder.txt"],
        }
    }

    pub fn mods_folder(self) -> &'static str {
        "Data"
    }

    fn steam_folders(self) -> &'static [&'static str] {
        match self {
            GameId::SkyrimSe => &["Skyrim Special Edition"],
            GameId::Skyrim => &["Skyrim"],
            GameId::EnderalSe => &["Enderal Special Edition"],
            GameId::Fallout4 => &["Fallout 4"],
            GameId::FalloutNv => &["Fallout New Vegas"],
            GameId::Fallout3 => &["Fallout 3", "Fallout 3 goty"],
            GameId::Oblivion => &["Oblivion"],
        }
    }

    pub fn from_vortex_id(value: &str) -> Option<Self> {
        supported_games()
            .into_iter()
            .find(|game| game.vortex_id().eq_ignore_ascii_case(value))
    }

    pub fn from_mo2_name(value: &str) -> Option<Self> {
        supported_games()
            .into_iter()
            .find(|game| game.mo2_name().eq_ignore_ascii_case(value))
    }
}

impl FromStr for GameId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let needle = value.trim();
        supported_games()
            .into_iter()
            .find(|game| {
                game.as_str().eq_ignore_ascii_case(needle)
                    || game.vortex_id().eq_ignore_ascii_case(needle)
                    || game.display_name().eq_ignore_ascii_case(needle)
            })
            .with_context(|| format!("unsupported game: {needle}"))
    }
}

pub fn supported_games() -> Vec<GameId> {
    vec![
        GameId::SkyrimSe,
        GameId::Skyrim,
        GameId::EnderalSe,
        GameId::Fallout4,
        GameId::FalloutNv,
        GameId::Fallout3,
        GameId::Oblivion,
    ]
}

pub fn ini_dir(game: GameId) -> Result<PathBuf> {
    let dirs = UserDirs::new().context("resolve user dirs")?;
    let documents = match dirs.document_dir() {
        Some(dir) => dir.to_path_buf(),
        None => dirs.home_dir().join("Documents"),
    };
    Ok(documents.join("My Games").join(game.ini_folder()))
}

pub fn looks_like_game_root(game: GameId, path: &Path) -> bool {
    path.join(game.mods_folder()).is_dir()
}

pub fn detect_install_dir(game: GameId) -> Result<PathBuf> {
    let Some(found) = find_game_root(game) else {
        bail!("could not locate {} install directory", game.display_name());
    };
    if !looks_like_game_root(game, &found) {
        bail!(
            "invalid game root: expected {}/ in {}",
            game.mods_folder(),
            found.display()
        );
    }
    Ok(found)
}

fn find_game_root(game: GameId) -> Option<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(dirs) = UserDirs::new() {
        let home = dirs.home_dir();
        candidates.push(home.join(".local/share/Steam"));
        candidates.push(home.join(".steam/steam"));
    }
    candidates.push(PathBuf::from("C:/Program Files (x86)/Steam"));

    let mut libraries = Vec::new();
    for base in candidates {
        let vdf = base.join("steamapps/libraryfolders.vdf");
        if vdf.exists() {
            if let Ok(paths) = parse_steam_library_paths(&vdf) {
                libraries.extend(paths);
            }
        }
        libraries.push(base);
    }

    for lib in libraries {
        for folder in game.steam_folders() {
            let candidate = lib.join("steamapps/common").join(folder);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

fn parse_steam_library_paths(path: &Path) -> Result<Vec<PathBuf>> {
    let raw = fs::read_to_string(path).context("read libraryfolders.vdf")?;
    Ok(library_paths_from_vdf(&raw))
}

fn library_paths_from_vdf(raw: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if !line.contains("\"path\"") {
            continue;
        }

        let parts: Vec<&str> = line.split('"').collect();
        if parts.len() >= 4 {
            let path = parts[3].replace("\\\\", "\\");
            paths.push(PathBuf::from(path));
        }
    }
    paths
}
