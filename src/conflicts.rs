use crate::{
    error::{MigrationError, MigrationResult},
    instance::{FileEntry, FileScope, Mod},
    report::SingleFileConflict,
};
use anyhow::Context;
use blake3::Hasher;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fs,
    io::Read,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const ROOT_FOLDER: &str = "Root";

type EntryKey = (FileScope, String);

#[derive(Debug, Clone)]
struct Candidate {
    owner_id: String,
    source: PathBuf,
    size: u64,
}

#[derive(Debug)]
struct Slot {
    entry: FileEntry,
    losers: Vec<Candidate>,
}

#[derive(Debug, Default)]
pub struct ConflictMap {
    entries: BTreeMap<EntryKey, FileEntry>,
    conflicts: Vec<SingleFileConflict>,
    overridden: usize,
    unreadable: Vec<UnreadableMod>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableMod {
    pub owner: usize,
    pub mod_id: String,
    pub reason: String,
}

impl ConflictMap {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    pub fn get(&self, scope: FileScope, relative_path: &Path) -> Option<&FileEntry> {
        self.entries.get(&(scope, entry_key(relative_path)))
    }

    pub fn by_owner(&self) -> BTreeMap<usize, Vec<&FileEntry>> {
        let mut grouped: BTreeMap<usize, Vec<&FileEntry>> = BTreeMap::new();
        for entry in self.entries.values() {
            grouped.entry(entry.owner).or_default().push(entry);
        }
        grouped
    }

    pub fn scopes_for(&self, owner: usize) -> BTreeSet<FileScope> {
        self.entries
            .values()
            .filter(|entry| entry.owner == owner)
            .map(|entry| entry.scope)
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|entry| entry.size).sum()
    }

    pub fn overridden(&self) -> usize {
        self.overridden
    }

    pub fn single_file_conflicts(&self) -> &[SingleFileConflict] {
        &self.conflicts
    }

    pub fn unreadable(&self) -> &[UnreadableMod] {
        &self.unreadable
    }

    pub fn into_entries(self) -> Vec<FileEntry> {
        self.entries.into_values().collect()
    }
}

/// Folds every participating mod's files into one winner per path, in
/// ascending priority so the highest priority mod ends up owning the path.
pub fn resolve(mods: &[Mod]) -> MigrationResult<ConflictMap> {
    let mut order: Vec<usize> = (0..mods.len())
        .filter(|index| mods[*index].participates())
        .collect();
    order.sort_by_key(|index| mods[*index].priority);

    let mut seen = HashSet::new();
    for index in &order {
        let priority = mods[*index].priority;
        if !seen.insert(priority) {
            return Err(MigrationError::SourceUnreadable(format!(
                "duplicate mod priority {priority} ({})",
                mods[*index].id
            )));
        }
    }

    let mut slots: BTreeMap<EntryKey, Slot> = BTreeMap::new();
    let mut overridden = 0usize;
    let mut unreadable = Vec::new();
    for index in order {
        let entry = &mods[index];
        let files = match walk_mod(entry, index) {
            Ok(files) => files,
            Err(err) => {
                warn!(mod_id = %entry.id, "cannot read mod: {err:#}");
                unreadable.push(UnreadableMod {
                    owner: index,
                    mod_id: entry.id.clone(),
                    reason: format!("{err:#}"),
                });
                continue;
            }
        };
        for file in files {
            fold(&mut slots, file, &mut overridden);
        }
    }

    let mut conflicts = Vec::new();
    let mut entries = BTreeMap::new();
    for (key, slot) in slots {
        if !slot.losers.is_empty() {
            if let Some(conflict) = single_file_conflict(&slot) {
                conflicts.push(conflict);
            }
        }
        entries.insert(key, slot.entry);
    }

    debug!(
        files = entries.len(),
        overridden,
        single_file_conflicts = conflicts.len(),
        "resolved file conflicts"
    );

    Ok(ConflictMap {
        entries,
        conflicts,
        overridden,
        unreadable,
    })
}

pub fn enumerate_mod(entry: &Mod, owner: usize) -> MigrationResult<Vec<FileEntry>> {
    let mut slots = BTreeMap::new();
    let mut overridden = 0usize;
    for file in walk_mod(entry, owner)? {
        fold(&mut slots, file, &mut overridden);
    }
    Ok(slots.into_values().map(|slot| slot.entry).collect())
}

/// Every file of one mod across its scopes. Any unreadable directory or
/// file fails the whole mod.
fn walk_mod(entry: &Mod, owner: usize) -> anyhow::Result<Vec<FileEntry>> {
    let mut files = Vec::new();
    for (root, scope) in mod_sources(entry) {
        collect_mod_files(&root, scope, owner, entry, &mut files)?;
    }
    Ok(files)
}

fn mod_sources(entry: &Mod) -> Vec<(PathBuf, FileScope)> {
    if entry.path.as_os_str().is_empty() || !entry.path.is_dir() {
        return Vec::new();
    }
    if entry.deploy_type.is_some() {
        return vec![(entry.path.clone(), FileScope::Root)];
    }
    let mut sources = vec![(entry.path.clone(), FileScope::Data)];
    if let Some(root) = find_root_folder(&entry.path) {
        sources.push((root, FileScope::Root));
    }
    sources
}

pub fn find_root_folder(mod_path: &Path) -> Option<PathBuf> {
    let read = fs::read_dir(mod_path).ok()?;
    read.filter_map(|item| item.ok())
        .filter(|item| item.file_type().map(|kind| kind.is_dir()).unwrap_or(false))
        .map(|item| item.path())
        .find(|path| is_root_folder_name(path))
}

fn is_root_folder_name(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().eq_ignore_ascii_case(ROOT_FOLDER))
        .unwrap_or(false)
}

fn collect_mod_files(
    source_root: &Path,
    scope: FileScope,
    owner: usize,
    entry: &Mod,
    files: &mut Vec<FileEntry>,
) -> anyhow::Result<()> {
    let skip_root = scope == FileScope::Data;
    let walker = WalkDir::new(source_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|item| {
            if item.depth() == 1 && skip_root && item.file_type().is_dir() {
                if is_root_folder_name(item.path()) {
                    return false;
                }
            }
            !is_ignored_path(item.path().strip_prefix(source_root).unwrap_or(item.path()))
        });

    for item in walker {
        let item = item.with_context(|| format!("walk {:?}", source_root))?;
        if !item.file_type().is_file() {
            continue;
        }
        let rel = item
            .path()
            .strip_prefix(source_root)
            .context("rel path")?
            .to_path_buf();
        let size = item
            .metadata()
            .with_context(|| format!("stat {:?}", item.path()))?
            .len();
        files.push(FileEntry {
            relative_path: rel,
            scope,
            source: item.path().to_path_buf(),
            owner,
            owner_id: entry.id.clone(),
            size,
        });
    }
    Ok(())
}

fn fold(slots: &mut BTreeMap<EntryKey, Slot>, file: FileEntry, overridden: &mut usize) {
    let key = (file.scope, entry_key(&file.relative_path));
    match slots.get_mut(&key) {
        Some(slot) => {
            let previous = std::mem::replace(&mut slot.entry, file);
            slot.losers.push(Candidate {
                owner_id: previous.owner_id,
                source: previous.source,
                size: previous.size,
            });
            *overridden += 1;
        }
        None => {
            slots.insert(
                key,
                Slot {
                    entry: file,
                    losers: Vec::new(),
                },
            );
        }
    }
}

fn single_file_conflict(slot: &Slot) -> Option<SingleFileConflict> {
    let winner = &slot.entry;
    let mut winner_hash: Option<Option<blake3::Hash>> = None;
    let mut losers = Vec::new();
    for loser in &slot.losers {
        let differs = if loser.size != winner.size {
            true
        } else {
            let expected =
                *winner_hash.get_or_insert_with(|| hash_file(&winner.source).ok());
            // An unreadable side counts as different.
            match (expected, hash_file(&loser.source)) {
                (Some(expected), Ok(hash)) => hash != expected,
                _ => true,
            }
        };
        if differs && !losers.contains(&loser.owner_id) {
            losers.push(loser.owner_id.clone());
        }
    }
    if losers.is_empty() {
        return None;
    }
    Some(SingleFileConflict {
        relative_path: winner.relative_path.clone(),
        scope: winner.scope,
        winner: winner.owner_id.clone(),
        losers,
    })
}

fn hash_file(path: &Path) -> anyhow::Result<blake3::Hash> {
    let mut file = fs::File::open(path).with_context(|| format!("open {:?}", path))?;
    let mut hasher = Hasher::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize())
}

pub fn entry_key(relative_path: &Path) -> String {
    relative_path
        .components()
        .map(|part| part.as_os_str().to_string_lossy().to_lowercase())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn is_ignored_path(relative: &Path) -> bool {
    let top_level_only = relative.components().count() == 1;
    let ignored = relative.components().any(|component| {
        let part = component.as_os_str().to_string_lossy();
        part.eq_ignore_ascii_case("__MACOSX")
            || part.eq_ignore_ascii_case(".ds_store")
            || part.eq_ignore_ascii_case("thumbs.db")
            || part.eq_ignore_ascii_case("desktop.ini")
            || part.eq_ignore_ascii_case("__folder_managed_by_vortex")
            || part == ".git"
            || part == ".svn"
            || part == ".vscode"
    });
    ignored
        || (top_level_only
            && relative
                .to_string_lossy()
                .eq_ignore_ascii_case("meta.ini"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn mod_in(root: &Path, id: &str, priority: usize) -> Mod {
        let path = root.join(id);
        fs::create_dir_all(&path).unwrap();
        let mut entry = Mod::new(id, id, path);
        entry.priority = priority;
        entry
    }

    #[test]
    fn highest_priority_wins_every_shared_path() {
        let tmp = tempfile::tempdir().unwrap();
        let a = mod_in(tmp.path(), "A", 1);
        let b = mod_in(tmp.path(), "B", 2);
        write(&a.path.join("textures/a.dds"), "from a");
        write(&b.path.join("textures/a.dds"), "from b");
        write(&b.path.join("meshes/b.nif"), "mesh");

        let map = resolve(&[a, b]).unwrap();
        assert_eq!(map.len(), 2);
        for entry in map.entries() {
            assert_eq!(entry.owner_id, "B");
            assert!(entry.source.starts_with(tmp.path().join("B")));
        }
        assert_eq!(map.overridden(), 1);
    }

    #[test]
    fn input_order_does_not_change_the_result() {
        let tmp = tempfile::tempdir().unwrap();
        let a = mod_in(tmp.path(), "A", 5);
        let b = mod_in(tmp.path(), "B", 1);
        let c = mod_in(tmp.path(), "C", 3);
        for entry in [&a, &b, &c] {
            write(&entry.path.join("shared.esp"), &entry.id);
            write(&entry.path.join(format!("{}.txt", entry.id)), "x");
        }

        let forward = resolve(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let backward = resolve(&[c, b, a]).unwrap();
        let left: Vec<_> = forward
            .entries()
            .map(|entry| (entry.relative_path.clone(), entry.owner_id.clone()))
            .collect();
        let right: Vec<_> = backward
            .entries()
            .map(|entry| (entry.relative_path.clone(), entry.owner_id.clone()))
            .collect();
        assert_eq!(left, right);
        assert_eq!(
            forward.get(FileScope::Data, Path::new("shared.esp")).unwrap().owner_id,
            "A"
        );
    }

    #[test]
    fn paths_collide_case_insensitively() {
        let tmp = tempfile::tempdir().unwrap();
        let a = mod_in(tmp.path(), "A", 0);
        let b = mod_in(tmp.path(), "B", 1);
        write(&a.path.join("Textures/Sky.dds"), "a");
        write(&b.path.join("textures/sky.DDS"), "bb");

        let map = resolve(&[a, b]).unwrap();
        assert_eq!(map.len(), 1);
        let entry = map.entries().next().unwrap();
        assert_eq!(entry.relative_path, PathBuf::from("textures/sky.DDS"));
        assert_eq!(map.single_file_conflicts().len(), 1);
        assert_eq!(map.single_file_conflicts()[0].losers, vec!["A".to_string()]);
    }

    #[test]
    fn identical_content_is_not_a_single_file_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let a = mod_in(tmp.path(), "A", 0);
        let b = mod_in(tmp.path(), "B", 1);
        write(&a.path.join("same.txt"), "identical");
        write(&b.path.join("same.txt"), "identical");

        let map = resolve(&[a, b]).unwrap();
        assert!(map.single_file_conflicts().is_empty());
        assert_eq!(map.overridden(), 1);
    }

    #[test]
    fn disabled_mods_and_meta_ini_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let a = mod_in(tmp.path(), "A", 0);
        let mut b = mod_in(tmp.path(), "B", 1);
        b.enabled = false;
        write(&a.path.join("meta.ini"), "[General]");
        write(&a.path.join("docs/meta.ini"), "kept");
        write(&a.path.join(".git/HEAD"), "ref");
        write(&b.path.join("plugin.esp"), "b");

        let map = resolve(&[a, b]).unwrap();
        let paths: Vec<_> = map.entries().map(|entry| entry.relative_path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("docs/meta.ini")]);
    }

    #[test]
    fn root_folder_files_are_root_scoped() {
        let tmp = tempfile::tempdir().unwrap();
        let a = mod_in(tmp.path(), "SKSE", 0);
        write(&a.path.join("Root/skse64_loader.exe"), "exe");
        write(&a.path.join("Scripts/skse.pex"), "pex");

        let map = resolve(&[a]).unwrap();
        assert!(map
            .get(FileScope::Root, Path::new("skse64_loader.exe"))
            .is_some());
        assert!(map.get(FileScope::Data, Path::new("Scripts/skse.pex")).is_some());
        assert_eq!(
            map.scopes_for(0),
            BTreeSet::from([FileScope::Data, FileScope::Root])
        );
    }

    #[test]
    fn enumerate_lists_disabled_mod_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut a = mod_in(tmp.path(), "A", 0);
        a.enabled = false;
        write(&a.path.join("plugin.esp"), "a");
        write(&a.path.join("Root/enb.ini"), "enb");

        let files = enumerate_mod(&a, 3).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|entry| entry.owner == 3));
        assert!(files
            .iter()
            .any(|entry| entry.scope == FileScope::Root && entry.relative_path == Path::new("enb.ini")));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_folder_leaves_the_mod_out() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let a = mod_in(tmp.path(), "A", 0);
        let b = mod_in(tmp.path(), "B", 1);
        write(&a.path.join("textures/sky.dds"), "a");
        write(&b.path.join("textures/sky.dds"), "b");
        write(&b.path.join("locked/inner.esp"), "b");
        let locked = b.path.join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&locked).is_ok() {
            // Permission bits do not apply to this user.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let map = resolve(&[a, b]).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(map.unreadable().len(), 1);
        assert_eq!(map.unreadable()[0].mod_id, "B");
        assert_eq!(map.unreadable()[0].owner, 1);
        let winner = map.get(FileScope::Data, Path::new("textures/sky.dds")).unwrap();
        assert_eq!(winner.owner_id, "A");
        assert!(map.entries().all(|entry| entry.owner_id != "B"));
    }

    #[test]
    fn unreadable_winner_still_reports_the_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let loser = tmp.path().join("A/plugin.esp");
        write(&loser, "same");
        let slot = Slot {
            entry: FileEntry {
                relative_path: PathBuf::from("plugin.esp"),
                scope: FileScope::Data,
                source: tmp.path().join("B/plugin.esp"),
                owner: 1,
                owner_id: "B".to_string(),
                size: 4,
            },
            losers: vec![Candidate {
                owner_id: "A".to_string(),
                source: loser,
                size: 4,
            }],
        };

        let conflict = single_file_conflict(&slot).unwrap();
        assert_eq!(conflict.winner, "B");
        assert_eq!(conflict.losers, vec!["A".to_string()]);
    }

    #[test]
    fn duplicate_priorities_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let a = mod_in(tmp.path(), "A", 1);
        let b = mod_in(tmp.path(), "B", 1);
        let err = resolve(&[a, b]).unwrap_err();
        assert!(matches!(err, MigrationError::SourceUnreadable(_)));
        assert!(err.is_fatal());
    }
}
