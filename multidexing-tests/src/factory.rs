mod contracts;
mod entities;
mod events;
mod handlers;
mod repos;
mod sources;

pub use contracts::*;
pub use entities::*;
pub use events::*;
pub use handlers::*;
pub use repos::*;
pub use sources::*;

use multidexing::{Config, Repo};

/// Config tuned for fast tests: tiny backoffs and head polling
pub fn test_config(repo: impl Repo + 'static) -> Config {
    Config::new(repo)
        .with_blocks_per_batch(10)
        .with_retry_backoff_ms(1)
        .with_head_polling_rate_ms(5)
        .with_max_fetch_retries(3)
        .with_max_commit_retries(3)
}
