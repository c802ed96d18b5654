pub mod app_config;
pub mod constants;
pub mod helpers;

pub use app_config::{AgentConfig, PlatformSettings, S3Settings};
pub use constants::*;
pub use helpers::*;
