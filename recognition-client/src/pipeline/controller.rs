// 管道控制器
//
// Single owner of every piece of pipeline state. Commands are plain method
// calls; asynchronous inputs (governor ticks, a finished capture, transport
// signals) are multiplexed by `step`, which the host drives in a loop.

use super::correlation::CorrelationTable;
use super::governor::{GovernorCounters, RateGovernor};
use super::state::{transition, LinkState, PipelineState, StateEvent, States};
use super::stats::{RunningStats, StatsAggregator};
use crate::capture::{CaptureConstraints, CaptureSource, EncodedFrame, FrameEncoder};
use crate::errors::{BackendError, CaptureError, ConnectionError, PipelineError, PreconditionError};
use crate::link::{ConnectOptions, EventTransport, LinkSession, TransportSignal};
use common::{
    ChangeProviderPayload, ClientEvent, ProcessFramePayload, RecognitionResult, Resolution,
    ServerConfig, ServerEvent,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Which result becomes "latest" when results arrive out of order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultRouting {
    /// Whatever arrives last wins, even for an older frame.
    #[default]
    LatestArrival,
    /// Results older than the last published frame are dropped.
    LatestDispatch,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub fps: u32,
    pub quality: f32,
    /// Dispatches older than this are forgotten.
    pub result_timeout: Duration,
    /// Used for capture until a backend advertises its maximum.
    pub default_resolution: Resolution,
    pub routing: ResultRouting,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            fps: 5,
            quality: 0.7,
            result_timeout: Duration::from_secs(5),
            default_resolution: Resolution::default(),
            routing: ResultRouting::default(),
        }
    }
}

/// Something observers may want to react to, produced by [`PipelineController::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineNotice {
    FrameDispatched { frame_id: u64 },
    ResultPublished(RecognitionResult),
    StatsUpdated(RunningStats),
    ConfigApplied(ServerConfig),
    CaptureFailed(CaptureError),
    BackendReported(BackendError),
    LinkChanged(LinkState),
    /// The link went away while streaming.
    StreamingHalted { reason: String },
}

type InFlight = Pin<Box<dyn Future<Output = (u64, Result<EncodedFrame, CaptureError>)> + Send>>;

enum Wakeup {
    Tick,
    Captured(u64, Result<EncodedFrame, CaptureError>),
    Signal(TransportSignal),
}

pub struct PipelineController {
    pipeline: PipelineState,
    encoder: FrameEncoder,
    governor: RateGovernor,
    table: CorrelationTable,
    link: LinkSession,
    stats: StatsAggregator,
    options: ControllerOptions,
    requested_fps: u32,
    quality: f32,
    in_flight: Option<InFlight>,
    /// Bumped on every start; captures from an older epoch are discarded.
    epoch: u64,
    last_result: Option<RecognitionResult>,
    last_published: Option<u64>,
    last_error: Option<PipelineError>,
    last_round_trip: Option<Duration>,
}

impl PipelineController {
    pub fn new(
        source: Arc<dyn CaptureSource>,
        transport: Arc<dyn EventTransport>,
        options: ControllerOptions,
        connect: ConnectOptions,
    ) -> Self {
        let quality = sanitize_quality(options.quality, ControllerOptions::default().quality);
        Self {
            pipeline: PipelineState::Idle,
            encoder: FrameEncoder::new(source),
            governor: RateGovernor::new(options.fps),
            table: CorrelationTable::new(),
            link: LinkSession::new(transport, connect),
            stats: StatsAggregator::new(),
            requested_fps: options.fps.max(1),
            quality,
            options,
            in_flight: None,
            epoch: 0,
            last_result: None,
            last_published: None,
            last_error: None,
            last_round_trip: None,
        }
    }

    // ------------------------------------------------------------------
    // 命令
    // ------------------------------------------------------------------

    /// Opens the capture source. Acquiring twice is a no-op.
    pub async fn acquire_capture(&mut self) -> Result<(), CaptureError> {
        if self.pipeline.has_capture() {
            debug!("Capture already acquired");
            return Ok(());
        }

        let constraints = CaptureConstraints {
            resolution: self
                .link
                .server_config()
                .map(|config| config.max_resolution)
                .unwrap_or(self.options.default_resolution),
            fps: self.governor.rate(),
        };

        if let Err(e) = self.encoder.source().acquire(&constraints).await {
            warn!("❌ Capture acquisition failed: {}", e);
            self.last_error = Some(e.clone().into());
            return Err(e);
        }

        self.force(StateEvent::CaptureAcquired);
        info!("✓ Capture acquired ({} @ {} fps)", constraints.resolution, constraints.fps);
        Ok(())
    }

    /// Stops streaming if needed, then closes the capture source.
    pub fn release_capture(&mut self) {
        if !self.pipeline.has_capture() {
            return;
        }
        self.stop_streaming();
        self.in_flight = None;
        self.governor.complete();
        self.encoder.source().release();
        self.force(StateEvent::CaptureReleased);
    }

    /// Opens the link and waits for the backend's config.
    ///
    /// Not cancel safe: the link stays `Connecting` if the future is dropped.
    pub async fn connect(&mut self, url: &str) -> Result<(), PipelineError> {
        self.apply(StateEvent::LinkConnecting)?;
        info!("🔗 Connecting to {}", url);

        match self.link.open(url).await {
            Ok(config) => {
                self.force(StateEvent::LinkConnected);
                self.apply_server_config(config);
                Ok(())
            }
            Err(e) => {
                warn!("❌ Connection to {} failed: {}", url, e);
                self.force(StateEvent::LinkFaulted);
                self.last_error = Some(e.clone().into());
                Err(e.into())
            }
        }
    }

    /// Closes the link. Streaming falls back to capture-only and every
    /// outstanding dispatch is forgotten. Idempotent.
    pub fn disconnect(&mut self) {
        if self.link.state() == LinkState::Disconnected {
            return;
        }
        info!("🔌 Disconnecting");
        self.force(StateEvent::LinkClosed);
    }

    pub fn start_streaming(&mut self) -> Result<(), PreconditionError> {
        if let Err(e) = self.apply(StateEvent::StreamingStarted) {
            warn!("Cannot start streaming: {}", e);
            self.last_error = Some(e.clone().into());
            return Err(e);
        }
        self.epoch += 1;
        self.governor.start();
        info!(
            "🎬 Streaming started at {} fps, quality {:.2}",
            self.governor.rate(),
            self.quality
        );
        Ok(())
    }

    /// No-op unless streaming. Outstanding results are still accepted.
    pub fn stop_streaming(&mut self) {
        if self.pipeline != PipelineState::Streaming {
            return;
        }
        self.force(StateEvent::StreamingStopped);
        info!("⏹️ Streaming stopped ({} frames outstanding)", self.table.len());
    }

    /// Sets the target rate, clamped to the backend's maximum. Returns the
    /// effective rate.
    pub fn set_rate(&mut self, fps: u32) -> u32 {
        self.requested_fps = fps.max(1);
        self.governor.set_rate(self.requested_fps)
    }

    /// Sets the encoder quality, clamped to `[0, 1]`. Returns the value in use.
    pub fn set_quality(&mut self, quality: f32) -> f32 {
        self.quality = sanitize_quality(quality, self.quality);
        self.quality
    }

    /// Asks for a stats snapshot. Returns whether the request went out.
    pub fn request_stats(&mut self) -> bool {
        self.link.send(ClientEvent::GetStats)
    }

    /// Asks the backend to zero its counters. Local counters keep their
    /// values until the backend answers with a snapshot.
    pub fn reset_stats(&mut self) -> bool {
        if !self.link.send(ClientEvent::ResetStats) {
            return false;
        }
        self.stats.request_reset();
        true
    }

    pub fn select_provider(&mut self, provider: &str) -> bool {
        self.link.send(ClientEvent::ChangeProvider(ChangeProviderPayload {
            provider: provider.to_string(),
        }))
    }

    /// Forgets dispatches older than the result timeout.
    pub fn expire_stale(&mut self) -> usize {
        self.table.expire_older_than(self.options.result_timeout)
    }

    // ------------------------------------------------------------------
    // 事件循环
    // ------------------------------------------------------------------

    /// Waits for the next input and handles it.
    ///
    /// Cancel safe. Pending forever when nothing is active (no streaming,
    /// no link), so hosts usually race it against their own inputs.
    pub async fn step(&mut self) -> Option<PipelineNotice> {
        let wakeup = tokio::select! {
            _ = self.governor.next_tick() => Wakeup::Tick,
            (epoch, outcome) = wait_in_flight(&mut self.in_flight) => Wakeup::Captured(epoch, outcome),
            signal = self.link.next_signal() => Wakeup::Signal(signal),
        };

        match wakeup {
            Wakeup::Tick => self.on_tick(),
            Wakeup::Captured(epoch, outcome) => self.on_captured(epoch, outcome),
            Wakeup::Signal(signal) => self.on_signal(signal),
        }
    }

    fn on_tick(&mut self) -> Option<PipelineNotice> {
        if self.in_flight.is_some() {
            return None;
        }
        if self.pipeline != PipelineState::Streaming {
            self.governor.complete();
            return None;
        }

        let encoder = self.encoder.clone();
        let quality = self.quality;
        let epoch = self.epoch;
        self.in_flight = Some(Box::pin(async move { (epoch, encoder.capture(quality).await) }));
        trace!("Capture started");
        None
    }

    fn on_captured(
        &mut self,
        epoch: u64,
        outcome: Result<EncodedFrame, CaptureError>,
    ) -> Option<PipelineNotice> {
        self.governor.complete();

        if epoch != self.epoch || self.pipeline != PipelineState::Streaming {
            debug!("Discarding capture from a finished streaming session");
            return None;
        }

        match outcome {
            Ok(frame) => self.dispatch(frame),
            Err(e) => {
                debug!("Capture failed: {}", e);
                self.last_error = Some(e.clone().into());
                Some(PipelineNotice::CaptureFailed(e))
            }
        }
    }

    fn dispatch(&mut self, frame: EncodedFrame) -> Option<PipelineNotice> {
        if !self.link.state().can_send() {
            debug!("Discarding capture, link is {:?}", self.link.state());
            return None;
        }

        let expired = self.table.expire_older_than(self.options.result_timeout);
        if expired > 0 {
            debug!("{} dispatches expired without a result", expired);
        }

        let (frame_id, event) = {
            let dispatch = self.table.register(frame);
            let event = ClientEvent::ProcessFrame(ProcessFramePayload {
                image: dispatch.image.clone(),
                frame_id: dispatch.id,
                quality: dispatch.quality,
                timestamp: dispatch.timestamp_ms,
            });
            (dispatch.id, event)
        };

        if !self.link.send(event) {
            self.table.resolve(frame_id);
            return None;
        }

        debug!("📤 Frame {} dispatched ({} outstanding)", frame_id, self.table.len());
        Some(PipelineNotice::FrameDispatched { frame_id })
    }

    fn on_signal(&mut self, signal: TransportSignal) -> Option<PipelineNotice> {
        match signal {
            TransportSignal::Event(event) => {
                self.link.record_healthy();
                let recovered = self.link.state() == LinkState::Degraded;
                if recovered {
                    self.force(StateEvent::LinkRecovered);
                    info!("✓ Link recovered");
                }
                let notice = self.on_server_event(event);
                match notice {
                    None if recovered => Some(PipelineNotice::LinkChanged(LinkState::Connected)),
                    notice => notice,
                }
            }
            TransportSignal::Error { reason } => {
                let errors = self.link.record_error();
                warn!(
                    "⚠️ Transport error ({}/{}): {}",
                    errors,
                    self.link.options().max_transport_errors,
                    reason
                );
                self.last_error = Some(ConnectionError::Transport { reason }.into());

                if self.link.error_budget_exhausted() {
                    return Some(self.teardown("too many consecutive transport errors".to_string()));
                }

                let before = self.link.state();
                self.force(StateEvent::LinkFaulted);
                let after = self.link.state();
                (before != after).then_some(PipelineNotice::LinkChanged(after))
            }
            TransportSignal::Closed { reason } => Some(self.teardown(reason)),
        }
    }

    fn on_server_event(&mut self, event: ServerEvent) -> Option<PipelineNotice> {
        match event {
            ServerEvent::Config(config) => {
                self.apply_server_config(config.clone());
                Some(PipelineNotice::ConfigApplied(config))
            }
            ServerEvent::RecognitionResult(result) => self.on_result(result),
            ServerEvent::Stats(payload) => {
                let stats = RunningStats::from(&payload);
                self.stats.apply_snapshot(stats.clone());
                Some(PipelineNotice::StatsUpdated(stats))
            }
            ServerEvent::Error(payload) => {
                if let Some(frame_id) = payload.frame_id {
                    self.table.resolve(frame_id);
                }
                warn!("❌ Server error [{}]: {}", payload.code, payload.message);
                let err = BackendError::Reported {
                    message: payload.message,
                    code: payload.code,
                };
                self.last_error = Some(err.clone().into());
                Some(PipelineNotice::BackendReported(err))
            }
        }
    }

    fn on_result(&mut self, result: RecognitionResult) -> Option<PipelineNotice> {
        self.table.expire_older_than(self.options.result_timeout);

        let Some(frame_id) = result.frame_id else {
            debug!("Ignoring recognition result without frame_id");
            return None;
        };
        let Some(dispatch) = self.table.resolve(frame_id) else {
            debug!("Ignoring result for unknown or expired frame {}", frame_id);
            return None;
        };
        self.last_round_trip = Some(dispatch.captured_at.elapsed());

        if self.options.routing == ResultRouting::LatestDispatch
            && self.last_published.is_some_and(|last| frame_id < last)
        {
            debug!("Dropping result for frame {}, a newer one is published", frame_id);
            return None;
        }

        if let Some(reason) = &result.error {
            self.last_error = Some(
                BackendError::RecognitionFailed {
                    frame_id: Some(frame_id),
                    reason: reason.clone(),
                }
                .into(),
            );
        }

        let confidence = result.confidence.unwrap_or_default();
        match (&result.subject, result.recognized) {
            (Some(subject), true) => info!(
                "🎯 Frame {} recognized: {} ({:.2})",
                frame_id, subject.name, confidence
            ),
            _ => debug!("Frame {}: no match ({:.2})", frame_id, confidence),
        }

        self.last_published = Some(frame_id);
        self.last_result = Some(result.clone());
        Some(PipelineNotice::ResultPublished(result))
    }

    fn teardown(&mut self, reason: String) -> PipelineNotice {
        let was_streaming = self.pipeline == PipelineState::Streaming;
        warn!("🔌 Link lost: {}", reason);
        self.last_error = Some(ConnectionError::Closed { reason: reason.clone() }.into());
        self.force(StateEvent::LinkClosed);
        if was_streaming {
            PipelineNotice::StreamingHalted { reason }
        } else {
            PipelineNotice::LinkChanged(LinkState::Disconnected)
        }
    }

    fn apply_server_config(&mut self, config: ServerConfig) {
        let effective = self.governor.set_ceiling(config.max_fps, self.requested_fps);
        self.encoder.set_accepted_formats(&config.supported_formats);
        info!(
            "📋 Backend config: provider={}, max_fps={}, max_resolution={} (running at {} fps)",
            config.provider, config.max_fps, config.max_resolution, effective
        );
        self.link.set_server_config(config);
    }

    // ------------------------------------------------------------------
    // 状态机
    // ------------------------------------------------------------------

    fn states(&self) -> States {
        States::new(self.pipeline, self.link.state())
    }

    fn apply(&mut self, event: StateEvent) -> Result<States, PreconditionError> {
        let before = self.states();
        let after = transition(before, event)?;

        self.pipeline = after.pipeline;
        self.link.set_state(after.link);

        if before.pipeline == PipelineState::Streaming && after.pipeline != PipelineState::Streaming {
            self.governor.stop();
        }
        if before.link != LinkState::Disconnected && after.link == LinkState::Disconnected {
            self.link.close();
            let flushed = self.table.flush();
            if flushed > 0 {
                info!("Forgot {} outstanding dispatches", flushed);
            }
        }
        if before != after {
            debug!("{:?} -> {:?} on {:?}", before, after, event);
        }
        Ok(after)
    }

    /// For events the current state is known to allow.
    fn force(&mut self, event: StateEvent) {
        if let Err(e) = self.apply(event) {
            warn!("Ignored state event: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // 观察接口
    // ------------------------------------------------------------------

    pub fn pipeline_state(&self) -> PipelineState {
        self.pipeline
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn last_result(&self) -> Option<&RecognitionResult> {
        self.last_result.as_ref()
    }

    pub fn stats(&self) -> &RunningStats {
        self.stats.current()
    }

    pub fn success_ratio(&self) -> f64 {
        self.stats.success_ratio()
    }

    pub fn stats_reset_pending(&self) -> bool {
        self.stats.reset_pending()
    }

    pub fn last_error(&self) -> Option<&PipelineError> {
        self.last_error.as_ref()
    }

    pub fn server_config(&self) -> Option<&ServerConfig> {
        self.link.server_config()
    }

    pub fn effective_fps(&self) -> u32 {
        self.governor.rate()
    }

    pub fn quality(&self) -> f32 {
        self.quality
    }

    pub fn outstanding_frames(&self) -> usize {
        self.table.len()
    }

    pub fn is_outstanding(&self, frame_id: u64) -> bool {
        self.table.contains(frame_id)
    }

    pub fn expired_frames(&self) -> u64 {
        self.table.expired_total()
    }

    pub fn governor_counters(&self) -> GovernorCounters {
        self.governor.counters()
    }

    pub fn last_round_trip(&self) -> Option<Duration> {
        self.last_round_trip
    }
}

async fn wait_in_flight(slot: &mut Option<InFlight>) -> (u64, Result<EncodedFrame, CaptureError>) {
    let Some(capture) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let outcome = capture.await;
    *slot = None;
    outcome
}

fn sanitize_quality(requested: f32, fallback: f32) -> f32 {
    if requested.is_finite() {
        requested.clamp(0.0, 1.0)
    } else {
        fallback
    }
}
