use thiserror::Error;

#[derive(Debug, Error)]
pub enum BanditError {
    #[error("no deployed arm for genome {0}")]
    UnknownArm(String),

    /// Rewards must be finite and inside `[0, 1]`.
    #[error("reward {reward} for genome {genome_id} is outside [0, 1]")]
    InvalidReward { genome_id: String, reward: f64 },

    #[error("bandit store I/O failed for {path}")]
    Store {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bandit store {path} is not a valid snapshot")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
