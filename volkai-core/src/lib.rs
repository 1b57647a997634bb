pub mod buffer;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod http_client;
pub mod model;
pub mod pipeline;
pub mod prompt;
pub mod providers;
pub mod source;
pub mod source_factory;
pub mod stream;
pub mod telemetry;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
