pub mod config;
pub mod error;
pub mod types;

pub use config::JobRunnerConfig;
pub use error::{CoreError, Result};
pub use types::{JobId, RunId};
