//! Frame pipeline: pacing, correlation, state and stats, driven by
//! [`PipelineController`].

pub mod controller;
pub mod correlation;
pub mod governor;
pub mod state;
pub mod stats;

pub use controller::{ControllerOptions, PipelineController, PipelineNotice, ResultRouting};
pub use correlation::{CorrelationTable, FrameDispatch, FrameId};
pub use governor::{GovernorCounters, RateGovernor, Tick, DEFAULT_MAX_FPS};
pub use state::{transition, LinkState, PipelineState, StateEvent, States};
pub use stats::{success_ratio, RunningStats, StatsAggregator};
