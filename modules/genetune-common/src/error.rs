use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid evolution config: {0}")]
    Evolution(String),

    #[error("invalid executor config: {0}")]
    Executor(String),

    #[error("invalid genome space: {0}")]
    Space(String),

    #[error("invalid bandit config: {0}")]
    Bandit(String),

    #[error("invalid daemon config: {0}")]
    Daemon(String),
}
