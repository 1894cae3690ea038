pub mod archive;
pub mod cache;
pub mod classify;
pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod model;
pub mod notify;
pub mod progress;
pub mod transfer;
pub mod tunnel;

pub use archive::{Archive, XnatClient};
pub use config::AppConfig;
pub use engine::{Collaborators, EngineSettings, SyncEngine, SyncReport, SyncTask};
pub use error::Error;
pub use progress::{ProgressReporter, SilentReporter};
