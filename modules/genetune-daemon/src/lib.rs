pub mod daemon;
pub mod dataset;
pub mod report;
pub mod reward;
pub mod service;

pub use daemon::ImprovementDaemon;
pub use dataset::{DatasetSource, JsonDataset, StaticDataset};
pub use report::{
    AbortStage, DaemonAbort, ImprovementReport, PromotedGenome, Rejection, RunStatus,
};
pub use reward::{OfflineCorrectness, RewardModel};
pub use service::GenetuneService;
