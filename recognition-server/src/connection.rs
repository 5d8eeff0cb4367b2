// 单个客户端会话
//
// `Session` turns client events into server events on an outbound queue;
// `handle_connection` binds one session to a QUIC bidirectional stream.

use crate::scorer::{decode_data_url, ScoreError};
use crate::server::BackendState;
use common::utils::now_millis;
use common::{
    decode_event, encode_event, error_codes, frame_codec, ClientEvent, ErrorPayload,
    ProcessFramePayload, RecognitionResult, Result, ServerEvent, StreamError,
};
use futures::{SinkExt, StreamExt};
use quinn::Connection;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct Session {
    id: Uuid,
    state: Arc<BackendState>,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    started: bool,
}

impl Session {
    pub fn new(state: Arc<BackendState>, outbound: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state,
            outbound,
            started: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn send(&self, event: ServerEvent) {
        if self.outbound.send(event).is_err() {
            debug!("Session {} outbound queue closed", self.id);
        }
    }

    fn send_error(&self, code: &str, message: impl Into<String>, frame_id: Option<u64>) {
        self.send(ServerEvent::Error(ErrorPayload {
            message: message.into(),
            code: code.to_string(),
            frame_id,
        }));
    }

    pub fn handle(&mut self, event: ClientEvent) {
        debug!("Session {} <- {}", self.id, event.name());

        match event {
            ClientEvent::SessionStart(payload) => {
                if self.started {
                    debug!("Session {} already started", self.id);
                    return;
                }
                self.started = true;
                self.state.registry.register(self.id, self.outbound.clone());
                let clients = self.state.stats.client_connected();
                info!(
                    "👤 Client {} ({}) joined, {} connected",
                    payload.client_id, payload.client_version, clients
                );

                let provider = self.state.current_provider();
                self.send(ServerEvent::Config(self.state.settings.client_config(&provider)));
                self.send(ServerEvent::Stats(self.state.stats_snapshot()));
            }
            ClientEvent::ProcessFrame(payload) => self.process_frame(payload),
            ClientEvent::GetStats => {
                self.send(ServerEvent::Stats(self.state.stats_snapshot()));
            }
            ClientEvent::ResetStats => {
                self.state.stats.reset();
                self.send(ServerEvent::Stats(self.state.stats_snapshot()));
            }
            ClientEvent::ChangeProvider(payload) => {
                if self.state.select_provider(&payload.provider) {
                    self.send(ServerEvent::Config(
                        self.state.settings.client_config(&payload.provider),
                    ));
                } else {
                    warn!("Provider {} is not available", payload.provider);
                    self.send_error(
                        error_codes::PROVIDER_NOT_AVAILABLE,
                        format!("Provider {} is not available", payload.provider),
                        None,
                    );
                }
            }
        }
    }

    /// Scores one frame off the read loop; the reply carries its frame id.
    fn process_frame(&self, payload: ProcessFramePayload) {
        let frame_id = payload.frame_id;
        if payload.image.is_empty() {
            warn!("Frame {} carries no image", frame_id);
            self.send_error(error_codes::INVALID_DATA, "Missing image data", Some(frame_id));
            return;
        }
        // 无法解码的图像按处理错误上报
        let image = match decode_data_url(&payload.image) {
            Ok((_, bytes)) => bytes,
            Err(e) => {
                warn!("Frame {} could not be decoded: {}", frame_id, e);
                self.send_error(
                    error_codes::PROCESSING_ERROR,
                    format!("Error processing frame: {}", e),
                    Some(frame_id),
                );
                return;
            }
        };

        let state = self.state.clone();
        let outbound = self.outbound.clone();
        let delay = state.simulated_latency();

        tokio::spawn(async move {
            let started = Instant::now();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let provider = state.current_provider();
            let threshold = state.settings.match_threshold;
            let event = match state.scorer.score(&image, &provider) {
                Ok(verdict) => {
                    let recognized = verdict.confidence >= threshold;
                    let elapsed = started.elapsed();
                    state.stats.record(recognized, elapsed);

                    ServerEvent::RecognitionResult(RecognitionResult {
                        recognized,
                        subject: recognized.then_some(verdict.subject),
                        confidence: Some(verdict.confidence),
                        provider: Some(provider),
                        processing_time_ms: Some(elapsed.as_secs_f64() * 1000.0),
                        frame_id: Some(frame_id),
                        timestamp: Some(now_millis()),
                        threshold: Some(threshold),
                        message: Some(
                            if recognized { "Subject recognized" } else { "No match" }.to_string(),
                        ),
                        error: None,
                    })
                }
                Err(e) => {
                    state.stats.record(false, started.elapsed());
                    let code = match e {
                        ScoreError::InvalidData(_) => error_codes::INVALID_DATA,
                        ScoreError::Processing(_) => error_codes::PROCESSING_ERROR,
                    };
                    ServerEvent::Error(ErrorPayload {
                        message: e.to_string(),
                        code: code.to_string(),
                        frame_id: Some(frame_id),
                    })
                }
            };

            if outbound.send(event).is_err() {
                debug!("Result for frame {} has no reader", frame_id);
            }
            state.broadcast_stats();
        });
    }

    /// Leaves the registry. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        self.state.registry.unregister(&self.id);
        let clients = self.state.stats.client_disconnected();
        info!("👋 Session {} left, {} connected", self.id, clients);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Serves one QUIC connection: a single bidirectional stream of events.
pub async fn handle_connection(connection: Connection, state: Arc<BackendState>) -> Result<()> {
    let (send, recv) = connection
        .accept_bi()
        .await
        .map_err(|e| StreamError::QuicError(e.to_string()))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let mut writer = FramedWrite::new(send, frame_codec());
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match encode_event(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping {} event: {}", event.name(), e);
                    continue;
                }
            };
            if let Err(e) = writer.send(frame).await {
                debug!("Writer stopped: {}", e);
                break;
            }
        }
        let _ = writer.get_mut().finish().await;
    });

    let mut session = Session::new(state, tx);
    let mut reader = FramedRead::new(recv, frame_codec());

    while let Some(frame) = reader.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Session {} read error: {}", session.id(), e);
                break;
            }
        };

        match decode_event::<ClientEvent>(&frame) {
            Ok(event) => session.handle(event),
            Err(e) => {
                warn!("Malformed event on session {}: {}", session.id(), e);
                session.send_error(error_codes::INVALID_DATA, format!("Malformed event: {}", e), None);
            }
        }
    }

    session.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerSettings;
    use crate::scorer::{Scorer, SimulatedScorer, Verdict};
    use common::{ChangeProviderPayload, SessionStartPayload, SubjectRecord};
    use std::time::Duration;

    struct FixedScorer(f64);

    impl Scorer for FixedScorer {
        fn score(&self, _image: &[u8], _provider: &str) -> std::result::Result<Verdict, ScoreError> {
            Ok(Verdict {
                confidence: self.0,
                subject: SubjectRecord {
                    id: 7,
                    name: "Test Subject".to_string(),
                    residence: None,
                    resident_type: None,
                    document: None,
                },
            })
        }
    }

    struct BrokenScorer;

    impl Scorer for BrokenScorer {
        fn score(&self, _image: &[u8], _provider: &str) -> std::result::Result<Verdict, ScoreError> {
            Err(ScoreError::Processing("model unavailable".to_string()))
        }
    }

    fn backend(scorer: Arc<dyn Scorer>) -> Arc<BackendState> {
        Arc::new(BackendState::new(ServerSettings::local(), scorer))
    }

    fn session(state: &Arc<BackendState>) -> (Session, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(state.clone(), tx), rx)
    }

    fn start() -> ClientEvent {
        ClientEvent::SessionStart(SessionStartPayload {
            client_id: "test".to_string(),
            client_version: "1.0.0".to_string(),
        })
    }

    fn frame(frame_id: u64, image: &str) -> ClientEvent {
        ClientEvent::ProcessFrame(ProcessFramePayload {
            image: image.to_string(),
            frame_id,
            quality: 0.7,
            timestamp: 0,
        })
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event expected")
            .expect("queue open")
    }

    #[tokio::test]
    async fn test_session_start_sends_config_then_stats() {
        let state = backend(Arc::new(SimulatedScorer::new()));
        let (mut session, mut rx) = session(&state);

        session.handle(start());
        let ServerEvent::Config(config) = next(&mut rx).await else {
            panic!("config expected first");
        };
        assert_eq!(config.provider, "SimulatedFaceMatch");
        let ServerEvent::Stats(stats) = next(&mut rx).await else {
            panic!("stats expected second");
        };
        assert_eq!(stats.connected_clients, 1);
        assert_eq!(state.registry.len(), 1);

        session.handle(start());
        assert!(rx.try_recv().is_err());
        assert_eq!(state.stats_snapshot().connected_clients, 1);
    }

    #[tokio::test]
    async fn test_frame_result_echoes_frame_id() {
        let state = backend(Arc::new(FixedScorer(0.9)));
        let (mut session, mut rx) = session(&state);
        session.handle(start());
        next(&mut rx).await;
        next(&mut rx).await;

        session.handle(frame(42, "data:image/jpeg;base64,/9j/2Q=="));
        let ServerEvent::RecognitionResult(result) = next(&mut rx).await else {
            panic!("result expected");
        };
        assert!(result.recognized);
        assert_eq!(result.frame_id, Some(42));
        assert_eq!(result.subject.map(|s| s.id), Some(7));
        assert_eq!(result.threshold, Some(0.5));

        // 每处理一帧都会广播统计
        let ServerEvent::Stats(stats) = next(&mut rx).await else {
            panic!("stats broadcast expected");
        };
        assert_eq!(stats.total_frames_processed, 1);
        assert_eq!(stats.successful_recognitions, 1);
    }

    #[tokio::test]
    async fn test_below_threshold_is_not_recognized() {
        let state = backend(Arc::new(FixedScorer(0.2)));
        let (mut session, mut rx) = session(&state);

        session.handle(frame(1, "data:image/png;base64,iVBORw=="));
        let ServerEvent::RecognitionResult(result) = next(&mut rx).await else {
            panic!("result expected");
        };
        assert!(!result.recognized);
        assert!(result.subject.is_none());
        assert_eq!(state.stats_snapshot().failed_recognitions, 1);
    }

    #[tokio::test]
    async fn test_undecodable_image_is_processing_error() {
        let state = backend(Arc::new(SimulatedScorer::new()));
        let (mut session, mut rx) = session(&state);

        session.handle(frame(9, "not-an-image"));
        let ServerEvent::Error(error) = next(&mut rx).await else {
            panic!("error expected");
        };
        assert_eq!(error.code, error_codes::PROCESSING_ERROR);
        assert_eq!(error.frame_id, Some(9));
        assert_eq!(state.stats_snapshot().total_frames_processed, 0);
    }

    #[tokio::test]
    async fn test_missing_image_is_invalid_data() {
        let state = backend(Arc::new(SimulatedScorer::new()));
        let (mut session, mut rx) = session(&state);

        session.handle(frame(4, ""));
        let ServerEvent::Error(error) = next(&mut rx).await else {
            panic!("error expected");
        };
        assert_eq!(error.code, error_codes::INVALID_DATA);
        assert_eq!(error.frame_id, Some(4));
    }

    #[tokio::test]
    async fn test_scorer_failure_is_processing_error() {
        let state = backend(Arc::new(BrokenScorer));
        let (mut session, mut rx) = session(&state);

        session.handle(frame(3, "data:image/jpeg;base64,/9j/2Q=="));
        let ServerEvent::Error(error) = next(&mut rx).await else {
            panic!("error expected");
        };
        assert_eq!(error.code, error_codes::PROCESSING_ERROR);
        assert_eq!(error.frame_id, Some(3));
    }

    #[tokio::test]
    async fn test_reset_acknowledges_with_snapshot() {
        let state = backend(Arc::new(SimulatedScorer::new()));
        state.stats.record(true, Duration::from_millis(10));
        let (mut session, mut rx) = session(&state);

        session.handle(ClientEvent::ResetStats);
        let ServerEvent::Stats(stats) = next(&mut rx).await else {
            panic!("stats expected");
        };
        assert_eq!(stats.total_frames_processed, 0);

        session.handle(ClientEvent::GetStats);
        assert!(matches!(next(&mut rx).await, ServerEvent::Stats(_)));
    }

    #[tokio::test]
    async fn test_change_provider() {
        let state = backend(Arc::new(SimulatedScorer::new()));
        let (mut session, mut rx) = session(&state);

        session.handle(ClientEvent::ChangeProvider(ChangeProviderPayload {
            provider: "SimulatedFallback".to_string(),
        }));
        let ServerEvent::Config(config) = next(&mut rx).await else {
            panic!("config expected");
        };
        assert_eq!(config.provider, "SimulatedFallback");

        session.handle(ClientEvent::ChangeProvider(ChangeProviderPayload {
            provider: "Missing".to_string(),
        }));
        let ServerEvent::Error(error) = next(&mut rx).await else {
            panic!("error expected");
        };
        assert_eq!(error.code, error_codes::PROVIDER_NOT_AVAILABLE);
        assert_eq!(state.current_provider(), "SimulatedFallback");
    }

    #[tokio::test]
    async fn test_dropping_session_unregisters() {
        let state = backend(Arc::new(SimulatedScorer::new()));
        let (mut session, _rx) = session(&state);
        session.handle(start());
        assert_eq!(state.registry.len(), 1);

        drop(session);
        assert!(state.registry.is_empty());
        assert_eq!(state.stats_snapshot().connected_clients, 0);
    }
}
