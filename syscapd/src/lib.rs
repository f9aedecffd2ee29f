pub mod associations;
pub mod bpf_config;
pub mod cache;
pub mod config;
pub mod error;
pub mod identity;
pub mod ingestor;
pub mod loader;
pub mod metrics;
pub mod recording;
pub mod relay;
pub mod report;
pub mod rpc;
pub mod state;

pub use config::Config;
pub use metrics::Metrics;
pub use state::AppState;
