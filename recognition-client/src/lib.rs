pub mod capture;
pub mod config;
pub mod errors;
pub mod link;
pub mod pipeline;
pub mod serde_helpers;
#[cfg(test)]
mod quic_loopback_test;

pub use errors::*;
pub use pipeline::{
    ControllerOptions, LinkState, PipelineController, PipelineNotice, PipelineState, ResultRouting,
};
