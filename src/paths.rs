use anyhow::{Context, Result};
use directories::BaseDirs;
use std::{
    env,
    path::{Component, Path, PathBuf},
};

pub const APP_DIR_NAME: &str = "mod-migrator";

pub fn app_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join(APP_DIR_NAME))
}

pub fn mo2_global_root() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("ModOrganizer"))
}

pub fn vortex_app_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_dir().join("Vortex"))
}

pub fn resolve_placeholders(raw: &str, vars: &[(&str, &Path)]) -> PathBuf {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find(&['%', '{'][..]) {
        let open = rest.as_bytes()[start] as char;
        let close = if open == '%' { '%' } else { '}' };
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find(close) {
            Some(end) => {
                let name = &after[..end];
                match lookup_var(name, vars) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push(open);
                        out.push_str(name);
                        out.push(close);
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    PathBuf::from(out)
}

fn lookup_var(name: &str, vars: &[(&str, &Path)]) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    if let Some((_, value)) = vars
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
    {
        return Some(value.to_string_lossy().to_string());
    }
    env::var(name).ok()
}

pub fn normalize(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy().replace('\\', "/");
    let mut out = PathBuf::new();
    for component in Path::new(&raw).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// Canonical form of a path that may not exist yet: the longest existing
// ancestor is canonicalized and the remainder appended.
pub fn resolve_location(path: &Path) -> PathBuf {
    let normalized = normalize(path);
    let mut existing = normalized.as_path();
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return normalized,
        }
    }
}

pub fn same_location(a: &Path, b: &Path) -> bool {
    let a = resolve_location(a);
    let b = resolve_location(b);
    if cfg!(windows) {
        a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
    } else {
        a == b
    }
}

pub fn is_within(path: &Path, root: &Path) -> bool {
    resolve_location(path).starts_with(resolve_location(root))
}

pub fn relative_to(path: &Path, root: &Path) -> Option<PathBuf> {
    let path = resolve_location(path);
    let root = resolve_location(root);
    if let Ok(relative) = path.strip_prefix(&root) {
        return Some(relative.to_path_buf());
    }
    let mut parts = path.components();
    for expected in root.components() {
        let actual = parts.next()?;
        if !actual
            .as_os_str()
            .to_string_lossy()
            .eq_ignore_ascii_case(&expected.as_os_str().to_string_lossy())
        {
            return None;
        }
    }
    Some(parts.as_path().to_path_buf())
}

pub fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if candidate.exists() {
            return Some(candidate.to_path_buf());
        }
        current = candidate.parent();
    }
    None
}
