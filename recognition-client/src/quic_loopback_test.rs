#[cfg(test)]
mod tests {
    use crate::capture::SyntheticCamera;
    use crate::link::{ConnectOptions, QuicTransport};
    use crate::pipeline::{ControllerOptions, LinkState, PipelineController, PipelineNotice, PipelineState};
    use recognition_server::{RecognitionServer, ServerSettings};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::{timeout_at, Instant};

    fn start_server() -> (Arc<RecognitionServer>, String) {
        let server = Arc::new(RecognitionServer::bind(ServerSettings::local()).unwrap());
        let url = format!("quic://{}", server.local_addr().unwrap());
        let runner = server.clone();
        tokio::spawn(async move {
            let _ = runner.run().await;
        });
        (server, url)
    }

    fn controller() -> PipelineController {
        PipelineController::new(
            Arc::new(SyntheticCamera::new()),
            Arc::new(QuicTransport::new()),
            ControllerOptions {
                fps: 10,
                ..Default::default()
            },
            ConnectOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_streams_frames_over_quic() {
        let (server, url) = start_server();
        let mut controller = controller();

        controller.acquire_capture().await.unwrap();
        controller.connect(&url).await.unwrap();
        assert_eq!(controller.link_state(), LinkState::Connected);
        assert_eq!(
            controller.server_config().map(|c| c.provider.as_str()),
            Some("SimulatedFaceMatch")
        );

        controller.start_streaming().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut results = 0;
        while results < 3 || controller.stats().frames_processed < 3 {
            match timeout_at(deadline, controller.step()).await {
                Ok(Some(PipelineNotice::ResultPublished(result))) => {
                    assert!(result.frame_id.is_some());
                    results += 1;
                }
                Ok(Some(PipelineNotice::BackendReported(e))) => panic!("backend error: {}", e),
                Ok(_) => {}
                Err(_) => panic!("only {} results before the deadline", results),
            }
        }
        assert!(controller.last_result().is_some());
        assert!(controller.last_round_trip().is_some());

        controller.stop_streaming();
        controller.disconnect();
        assert_eq!(controller.link_state(), LinkState::Disconnected);
        assert_eq!(controller.outstanding_frames(), 0);
        server.close();
    }

    #[tokio::test]
    async fn test_server_shutdown_halts_streaming() {
        let (server, url) = start_server();
        let mut controller = controller();

        controller.acquire_capture().await.unwrap();
        controller.connect(&url).await.unwrap();
        controller.start_streaming().unwrap();

        server.close();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match timeout_at(deadline, controller.step()).await {
                Ok(Some(PipelineNotice::StreamingHalted { .. })) => break,
                Ok(_) => {}
                Err(_) => panic!("link never dropped"),
            }
        }
        assert_eq!(controller.pipeline_state(), PipelineState::CaptureOnly);
        assert_eq!(controller.link_state(), LinkState::Disconnected);
    }
}
