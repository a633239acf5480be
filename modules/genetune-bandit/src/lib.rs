pub mod arm;
pub mod bandit;
pub mod error;
pub mod feed;
pub mod store;

pub use arm::{ArmPrior, ArmStats, BanditArm};
pub use bandit::{ArmRecord, BanditSnapshot, ThompsonBandit};
pub use error::BanditError;
pub use feed::{spawn_reward_feed, FeedStats, RewardEvent};
pub use store::BanditStore;
