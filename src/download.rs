use crate::progress::{MigrationState, ProgressReporter};
use anyhow::{Context, Result};
use filetime::{set_file_mtime, FileTime};
use sha2::{Digest, Sha256};
use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use time::{Date, Month, PrimitiveDateTime, Time as TimeOfDay};
use tracing::{info, warn};

const USER_AGENT: &str = concat!("mod-migrator/", env!("CARGO_PKG_VERSION"));
const STAGING_DIR: &str = ".mod-migrator-download";

struct StagingGuard {
    path: PathBuf,
}

impl StagingGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

pub fn install_mo2(
    url: &str,
    sha256: Option<&str>,
    target: &Path,
    progress: &ProgressReporter,
) -> Result<()> {
    fs::create_dir_all(target).with_context(|| format!("create {:?}", target))?;
    let staging = target.join(STAGING_DIR);
    let _guard = StagingGuard::new(staging.clone());
    fs::create_dir_all(&staging).context("create download staging dir")?;

    let file_name = url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("ModOrganizer.7z");
    let archive = staging.join(file_name);
    progress.report(
        MigrationState::MigratingMods,
        0,
        0,
        Some(format!("Downloading {file_name}")),
    );
    download(url, &archive)?;
    install_archive(&archive, sha256, target)
}

pub fn install_archive(archive: &Path, sha256: Option<&str>, target: &Path) -> Result<()> {
    if let Some(expected) = sha256 {
        verify_sha256(archive, expected)?;
    }
    let staging_root = target.join(STAGING_DIR);
    let _guard = StagingGuard::new(staging_root.clone());
    let staging = staging_root.join("extract");
    if staging.exists() {
        fs::remove_dir_all(&staging).context("clear extract dir")?;
    }
    fs::create_dir_all(&staging).context("create extract dir")?;
    extract_archive(archive, &staging)?;

    let content_root = single_child_dir(&staging)?.unwrap_or_else(|| staging.clone());
    let moved = move_missing(&content_root, target)?;
    info!(files = moved, target = %target.display(), "installed Mod Organizer 2");
    Ok(())
}

fn download(url: &str, path: &Path) -> Result<()> {
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(5))
        .timeout_read(Duration::from_secs(60))
        .timeout_write(Duration::from_secs(60))
        .build();
    let response = agent
        .get(url)
        .set("User-Agent", USER_AGENT)
        .call()
        .with_context(|| format!("download {url}"))?;
    let mut reader = response.into_reader();
    let mut file = File::create(path).context("create download file")?;
    io::copy(&mut reader, &mut file).context("write download file")?;
    Ok(())
}

pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let mut file = File::open(path).context("open archive for checksum")?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let actual = format!("{:x}", hasher.finalize());
    if actual != expected.trim().to_lowercase() {
        return Err(anyhow::anyhow!("Checksum mismatch for {}", path.display()));
    }
    Ok(())
}

pub fn extract_archive(path: &Path, dest: &Path) -> Result<()> {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "zip" => extract_zip(path, dest),
        "7z" => extract_7z(path, dest),
        other => Err(anyhow::anyhow!("unsupported archive type: {other:?}")),
    }
}

fn extract_zip(path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(path).context("open zip")?;
    let mut archive = zip::ZipArchive::new(file).context("read zip")?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("zip entry")?;
        let Some(out_path) = file.enclosed_name() else {
            warn!(name = file.name(), "skipping zip entry outside the archive root");
            continue;
        };

        let out_path = dest.join(out_path);
        if file.is_dir() {
            fs::create_dir_all(&out_path).context("create zip dir")?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).context("create zip dir")?;
        }

        let mut out_file = File::create(&out_path).context("write zip entry")?;
        io::copy(&mut file, &mut out_file).context("extract zip entry")?;
        if let Some(dt) = file.last_modified() {
            if let Some(mtime) = zip_time_to_unix(dt) {
                let _ = set_file_mtime(&out_path, FileTime::from_unix_time(mtime, 0));
            }
        }
    }

    Ok(())
}

fn zip_time_to_unix(dt: zip::DateTime) -> Option<i64> {
    let month = Month::try_from(dt.month()).ok()?;
    let date = Date::from_calendar_date(dt.year() as i32, month, dt.day()).ok()?;
    let time = TimeOfDay::from_hms(dt.hour(), dt.minute(), dt.second()).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc().unix_timestamp())
}

fn extract_7z(path: &Path, dest: &Path) -> Result<()> {
    match extract_with_7z(path, dest) {
        Ok(Some(())) => Ok(()),
        Ok(None) => sevenz_rust::decompress_file(path, dest)
            .with_context(|| format!("extract 7z archive {path:?}")),
        Err(err) => Err(err),
    }
}

fn extract_with_7z(path: &Path, dest: &Path) -> Result<Option<()>> {
    let output = Command::new("7z")
        .arg("x")
        .arg("-y")
        .arg(format!("-o{}", dest.display()))
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output();

    let output = match output {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context("launch 7z"),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!("7z extraction failed: {}", stderr.trim()));
    }

    Ok(Some(()))
}

fn single_child_dir(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .context("read extract dir")?
        .filter_map(|entry| entry.ok())
        .collect::<Vec<_>>();
    if entries.len() != 1 {
        return Ok(None);
    }
    let entry = entries.remove(0);
    if entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
        Ok(Some(entry.path()))
    } else {
        Ok(None)
    }
}

fn move_missing(source: &Path, target: &Path) -> Result<usize> {
    let mut moved = 0;
    for entry in walkdir::WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(source).context("rel path")?;
        let dest = target.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).context("create dir")?;
        } else if entry.file_type().is_file() && !dest.exists() {
            if fs::rename(entry.path(), &dest).is_err() {
                fs::copy(entry.path(), &dest).with_context(|| format!("copy {:?}", dest))?;
            }
            moved += 1;
        }
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, contents) in files {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn sha256_hex(contents: &[u8]) -> String {
        format!("{:x}", Sha256::digest(contents))
    }

    #[test]
    fn install_flattens_single_top_level_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("mo2.zip");
        write_zip(
            &archive,
            &[
                ("ModOrganizer-2.5.2/ModOrganizer.exe", "exe"),
                ("ModOrganizer-2.5.2/plugins/a.dll", "dll"),
            ],
        );
        let target = tmp.path().join("instance");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("ModOrganizer.exe"), "existing").unwrap();

        install_archive(&archive, None, &target).unwrap();
        assert_eq!(
            fs::read_to_string(target.join("ModOrganizer.exe")).unwrap(),
            "existing"
        );
        assert!(target.join("plugins/a.dll").is_file());
        assert!(!target.join(STAGING_DIR).exists());
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("mo2.zip");
        write_zip(&archive, &[("ModOrganizer.exe", "exe")]);
        let bytes = fs::read(&archive).unwrap();

        assert!(verify_sha256(&archive, &sha256_hex(&bytes)).is_ok());
        let err = install_archive(&archive, Some("00ff"), &tmp.path().join("out")).unwrap_err();
        assert!(err.to_string().contains("Checksum mismatch"));
    }

    #[test]
    fn unknown_archive_type_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("mo2.rar");
        fs::write(&path, "rar").unwrap();
        assert!(extract_archive(&path, tmp.path()).is_err());
    }
}
