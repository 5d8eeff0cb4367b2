pub mod config;
pub mod connection;
pub mod registry;
pub mod scorer;
pub mod server;
pub mod stats;

pub use config::ServerSettings;
pub use registry::SessionRegistry;
pub use scorer::{Scorer, SimulatedScorer};
pub use server::{BackendState, RecognitionServer};
pub use stats::ServerStats;
