pub mod config;
pub mod conflicts;
pub mod download;
pub mod error;
pub mod game;
pub mod instance;
pub mod manager;
pub mod migrator;
pub mod modorganizer;
pub mod paths;
pub mod process;
pub mod progress;
pub mod report;
pub mod transfer;
pub mod vortex;
pub mod vortex_state;

pub use error::{MigrationError, MigrationResult};
pub use manager::{InstanceDescriptor, ManagerOptions, ModManager};
pub use migrator::{MigrationOptions, MigrationOutcome, Migrator};
