mod schema;

pub use schema::{
    CleanupConfig, Config, DaemonConfig, HistoryConfig, JobsConfig, LoggingConfig,
};
