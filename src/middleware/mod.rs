pub mod logging;
pub mod metrics;

pub use logging::RequestLogger;
pub use metrics::EndpointMetrics;
