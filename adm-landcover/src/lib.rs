pub mod collect;
pub mod commons;
pub mod config;
pub mod error;
pub mod geo_core;
pub mod geometric;
pub mod integrate;

pub use config::Config;
pub use error::PipelineError;
