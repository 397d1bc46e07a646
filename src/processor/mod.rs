pub mod feature_processor;
mod engine;
mod publisher;
mod subnet;
mod window;

pub use feature_processor::FeatureProcessor;
pub use engine::{now_secs, processing_loop, BatchOutcome, ClientReport, Monitor};
pub use publisher::status_line;
pub use subnet::LanSubnet;
pub use window::{
    aggregate_windows, entropy, FeatureName, FeatureVector, WindowOutput, FEATURE_COUNT,
};
