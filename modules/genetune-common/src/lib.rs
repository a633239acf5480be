pub mod config;
pub mod error;
pub mod types;

pub use config::{
    load_config, AppConfig, BanditConfig, BoolDomain, DaemonConfig, EvolutionConfig,
    ExecutorConfig, FileConfig, FitnessWeights, FloatRange, GradingMode, IntRange, SpaceConfig,
};
pub use error::ConfigError;
pub use types::*;
