#![allow(dead_code)]

use mod_migrator::{
    game::GameId,
    manager::{InstanceDescriptor, ManagerOptions, Mo2Options, VortexOptions},
    migrator::{MigrationOptions, Migrator},
    modorganizer::ModOrganizer,
    transfer::FixedSpaceProbe,
    vortex::Vortex,
    vortex_state::MemoryBackend,
};
use serde_json::json;
use std::{
    fs,
    path::{Path, PathBuf},
};

pub fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// A portable MO2 instance with a small load order:
/// SKSE (root files) < Tools separator < SkyUI < Disabled Mod < Patch.
/// Patch overrides SkyUI's `textures/shared.dds`.
pub fn mo2_source(root: &Path, tools: &[(&str, String)]) {
    let mut ini = String::from("[General]\ngameName=Skyrim Special Edition\nselected_profile=@ByteArray(Main)\n");
    if !tools.is_empty() {
        ini.push_str(&format!("\n[customExecutables]\nsize={}\n", tools.len()));
        for (index, (title, binary)) in tools.iter().enumerate() {
            ini.push_str(&format!("{n}\\title={title}\n{n}\\binary={binary}\n", n = index + 1));
        }
    }
    write(&root.join("ModOrganizer.ini"), &ini);
    write(
        &root.join("profiles/Main/modlist.txt"),
        "# This file was automatically generated by Mod Organizer.\n+Patch\n-Disabled Mod\n+SkyUI\n+Tools_separator\n+SKSE\n",
    );
    write(
        &root.join("profiles/Main/settings.ini"),
        "[General]\nLocalSaves=false\nLocalSettings=true\n",
    );
    write(&root.join("profiles/Main/skyrim.ini"), "[General]\nsLanguage=ENGLISH\n");
    write(&root.join("profiles/Main/plugins.txt"), "*patch.esp\n");

    write(&root.join("mods/SKSE/Root/skse64_loader.exe"), "loader");
    write(&root.join("mods/SKSE/scripts/skse.pex"), "pex");
    write(&root.join("mods/SkyUI/interface/skyui.swf"), "swf");
    write(&root.join("mods/SkyUI/textures/shared.dds"), "skyui");
    write(
        &root.join("mods/SkyUI/meta.ini"),
        "[General]\nmodid=12604\nversion=5.2.0.0\n",
    );
    write(&root.join("mods/Patch/textures/shared.dds"), "patch");
    write(&root.join("mods/Patch/patch.esp"), "esp");
    write(&root.join("mods/Disabled Mod/disabled.esp"), "disabled");
    fs::create_dir_all(root.join("mods/Tools_separator")).unwrap();
}

pub fn mo2_descriptor(root: &Path, game_dir: &Path) -> InstanceDescriptor {
    InstanceDescriptor {
        name: String::new(),
        game: GameId::SkyrimSe,
        root: root.to_path_buf(),
        profile: String::new(),
        game_dir: Some(game_dir.to_path_buf()),
        options: ManagerOptions::ModOrganizer(Mo2Options::default()),
    }
}

pub fn mo2_manager(tmp: &Path) -> Box<ModOrganizer> {
    Box::new(ModOrganizer::with_global_root(tmp.join("global")))
}

pub struct VortexFixture {
    pub app_dir: PathBuf,
    pub backend: MemoryBackend,
}

/// Vortex app folder with Skyrim SE discovered and profiles enabled, but
/// no profiles or mods yet.
pub fn vortex_destination(tmp: &Path) -> VortexFixture {
    let app_dir = tmp.join("Vortex");
    fs::create_dir_all(app_dir.join("skyrimse")).unwrap();
    let backend = MemoryBackend::new();
    backend.set(
        "settings###gameMode###discovered###skyrimse###path",
        json!(tmp.join("game").to_string_lossy()),
    );
    backend.set("settings###interface###profilesVisible", json!(true));
    VortexFixture { app_dir, backend }
}

/// A Vortex profile "Main" with three staged mods. Beta-2 and Alpha-1 both
/// ship `textures/shared.dds`; Alpha-1 loads after Beta-2 by rule.
/// ENB-3 deploys to the game root.
pub fn vortex_source(tmp: &Path) -> VortexFixture {
    let fixture = vortex_destination(tmp);
    let staging = fixture.app_dir.join("skyrimse/mods");
    write(&staging.join("Alpha-1/textures/shared.dds"), "alpha");
    write(&staging.join("Alpha-1/alpha.esp"), "esp");
    write(&staging.join("Beta-2/textures/shared.dds"), "beta!");
    write(&staging.join("Beta-2/meshes/beta.nif"), "nif");
    write(&staging.join("ENB-3/d3d11.dll"), "dll");
    fixture.backend.set_tree(
        "persistent###profiles",
        &json!({
            "p1": {
                "name": "Main",
                "gameId": "skyrimse",
                "modState": {
                    "Alpha-1": { "enabled": true },
                    "Beta-2": { "enabled": true },
                    "ENB-3": { "enabled": true }
                },
                "features": { "local_game_settings": true }
            }
        }),
    );
    fixture.backend.set(
        "settings###profiles###lastActiveProfile###skyrimse",
        json!("p1"),
    );
    fixture.backend.set_tree(
        "persistent###mods###skyrimse",
        &json!({
            "Alpha-1": {
                "installationPath": "Alpha-1",
                "type": "",
                "attributes": { "logicalFileName": "Alpha", "modId": 101 },
                "rules": [ { "type": "after", "reference": { "id": "Beta-2" } } ]
            },
            "Beta-2": {
                "installationPath": "Beta-2",
                "type": "",
                "attributes": { "logicalFileName": "Beta" }
            },
            "ENB-3": {
                "installationPath": "ENB-3",
                "type": "dinput",
                "attributes": { "name": "ENB Binaries" }
            }
        }),
    );
    fixture
}

pub fn vortex_descriptor(app_dir: &Path, profile: &str) -> InstanceDescriptor {
    InstanceDescriptor {
        name: profile.to_string(),
        game: GameId::SkyrimSe,
        root: app_dir.to_path_buf(),
        profile: String::new(),
        game_dir: None,
        options: ManagerOptions::Vortex(VortexOptions::default()),
    }
}

pub fn vortex_manager(backend: &MemoryBackend) -> Box<Vortex> {
    Box::new(Vortex::with_backend(backend.clone()))
}

pub fn options() -> MigrationOptions {
    let mut options = MigrationOptions::default();
    options.transfer.worker_threads = 2;
    options
}

pub fn migrator(
    source: Box<dyn mod_migrator::ModManager>,
    destination: Box<dyn mod_migrator::ModManager>,
    options: MigrationOptions,
) -> Migrator {
    Migrator::new(source, destination, options).with_space_probe(FixedSpaceProbe(u64::MAX))
}
