use crate::instance::ManagerKind;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("mod instance not found: {0}")]
    InstanceNotFound(String),

    #[error("{manager} database at {path:?} is locked; close {manager} and try again")]
    DatabaseLocked { manager: ManagerKind, path: PathBuf },

    #[error("Vortex has files deployed from {staging:?}; purge the deployment in Vortex first")]
    DeploymentBlocked { staging: PathBuf },

    #[error(
        "not enough free space on {volume:?}: {} required, {} available",
        human_bytes(.required),
        human_bytes(.available)
    )]
    InsufficientSpace {
        required: u64,
        available: u64,
        volume: PathBuf,
    },

    #[error("cannot determine free space for {path:?}: {reason}")]
    FreeSpaceUnknown { path: PathBuf, reason: String },

    #[error("cannot read source instance: {0}")]
    SourceUnreadable(String),

    #[error("source and destination resolve to the same location: {0:?}")]
    SourceEqualsDestination(PathBuf),

    #[error("invalid destination: {0}")]
    InvalidDestinationPath(String),

    #[error("the overwrite folder has no Vortex equivalent; move its contents into a regular mod first")]
    OverwriteUnsupported,

    #[error("tool {name} is not inside the instance or the game directory ({path:?})")]
    ToolOutsideInstance { name: String, path: PathBuf },

    #[error("tool {name} executable does not exist: {path:?}")]
    ToolMissing { name: String, path: PathBuf },

    #[error("failed to write instance metadata: {0:#}")]
    Write(anyhow::Error),

    #[error("migration cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MigrationError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrationError::InstanceNotFound(_)
                | MigrationError::DatabaseLocked { .. }
                | MigrationError::DeploymentBlocked { .. }
                | MigrationError::InsufficientSpace { .. }
                | MigrationError::FreeSpaceUnknown { .. }
                | MigrationError::SourceUnreadable(_)
                | MigrationError::SourceEqualsDestination(_)
                | MigrationError::InvalidDestinationPath(_)
                | MigrationError::Cancelled
        )
    }
}

pub type MigrationResult<T> = std::result::Result<T, MigrationError>;

fn human_bytes(bytes: &u64) -> String {
    format_bytes(*bytes)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(MigrationError::InstanceNotFound("x".into()).is_fatal());
        assert!(MigrationError::SourceEqualsDestination(PathBuf::from("/a")).is_fatal());
        assert!(MigrationError::SourceUnreadable("bad modlist".into()).is_fatal());
        assert!(MigrationError::FreeSpaceUnknown {
            path: PathBuf::from("/mnt/x"),
            reason: "no volume".into(),
        }
        .is_fatal());
        assert!(!MigrationError::OverwriteUnsupported.is_fatal());
        assert!(!MigrationError::Other(anyhow::anyhow!("io")).is_fatal());
        assert!(!MigrationError::Write(anyhow::anyhow!("disk full")).is_fatal());
    }

    #[test]
    fn bytes_are_human_readable() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }
}
