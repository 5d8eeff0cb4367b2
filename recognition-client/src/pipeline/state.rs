//! Pipeline and link state machine.
//!
//! Every state change in the controller goes through [`transition`], which
//! consumes one tagged [`StateEvent`] and either yields the next pair of
//! states or rejects the event.

use crate::errors::PreconditionError;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Open, but at least one transport error since it was last healthy.
    Degraded,
}

impl LinkState {
    /// Whether best-effort sends are attempted in this state.
    pub fn can_send(self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Degraded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PipelineState {
    #[default]
    Idle,
    CaptureOnly,
    Streaming,
}

impl PipelineState {
    pub fn has_capture(self) -> bool {
        !matches!(self, PipelineState::Idle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    CaptureAcquired,
    CaptureReleased,
    StreamingStarted,
    StreamingStopped,
    LinkConnecting,
    LinkConnected,
    LinkFaulted,
    LinkRecovered,
    LinkClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct States {
    pub pipeline: PipelineState,
    pub link: LinkState,
}

impl States {
    pub const fn new(pipeline: PipelineState, link: LinkState) -> Self {
        Self { pipeline, link }
    }
}

pub fn transition(current: States, event: StateEvent) -> Result<States, PreconditionError> {
    use LinkState as L;
    use PipelineState as P;

    let States { pipeline, link } = current;
    let illegal = || PreconditionError::IllegalTransition {
        pipeline,
        link,
        event,
    };

    let next = match event {
        StateEvent::CaptureAcquired => match pipeline {
            P::Idle => States::new(P::CaptureOnly, link),
            _ => return Err(illegal()),
        },
        StateEvent::CaptureReleased => States::new(P::Idle, link),
        StateEvent::StreamingStarted => match (pipeline, link) {
            (P::CaptureOnly, L::Connected) => States::new(P::Streaming, link),
            (P::Streaming, _) => return Err(PreconditionError::AlreadyStreaming),
            (P::Idle, _) => return Err(PreconditionError::CaptureNotAcquired { pipeline }),
            (P::CaptureOnly, other) => return Err(PreconditionError::LinkNotReady { link: other }),
        },
        StateEvent::StreamingStopped => match pipeline {
            P::Streaming => States::new(P::CaptureOnly, link),
            _ => current,
        },
        StateEvent::LinkConnecting => match link {
            L::Disconnected => States::new(pipeline, L::Connecting),
            _ => return Err(PreconditionError::LinkBusy { link }),
        },
        StateEvent::LinkConnected => match link {
            L::Connecting => States::new(pipeline, L::Connected),
            _ => return Err(illegal()),
        },
        StateEvent::LinkFaulted => match link {
            L::Connected | L::Degraded => States::new(pipeline, L::Degraded),
            // 连接尚未建立时的故障视为连接失败
            L::Connecting | L::Disconnected => States::new(demote(pipeline), L::Disconnected),
        },
        StateEvent::LinkRecovered => match link {
            L::Degraded => States::new(pipeline, L::Connected),
            _ => current,
        },
        StateEvent::LinkClosed => States::new(demote(pipeline), L::Disconnected),
    };

    Ok(next)
}

/// Streaming cannot outlive the link.
fn demote(pipeline: PipelineState) -> PipelineState {
    match pipeline {
        PipelineState::Streaming => PipelineState::CaptureOnly,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINES: [PipelineState; 3] = [
        PipelineState::Idle,
        PipelineState::CaptureOnly,
        PipelineState::Streaming,
    ];
    const LINKS: [LinkState; 4] = [
        LinkState::Disconnected,
        LinkState::Connecting,
        LinkState::Connected,
        LinkState::Degraded,
    ];

    #[test]
    fn test_streaming_requires_capture_and_connected_link() {
        for pipeline in PIPELINES {
            for link in LINKS {
                let result = transition(States::new(pipeline, link), StateEvent::StreamingStarted);
                if pipeline == PipelineState::CaptureOnly && link == LinkState::Connected {
                    assert_eq!(
                        result.unwrap(),
                        States::new(PipelineState::Streaming, LinkState::Connected)
                    );
                } else {
                    assert!(result.is_err(), "({pipeline:?}, {link:?}) must be rejected");
                }
            }
        }
    }

    #[test]
    fn test_link_close_demotes_streaming() {
        let next = transition(
            States::new(PipelineState::Streaming, LinkState::Degraded),
            StateEvent::LinkClosed,
        )
        .unwrap();
        assert_eq!(next, States::new(PipelineState::CaptureOnly, LinkState::Disconnected));

        for pipeline in [PipelineState::Idle, PipelineState::CaptureOnly] {
            let next = transition(States::new(pipeline, LinkState::Connected), StateEvent::LinkClosed)
                .unwrap();
            assert_eq!(next.pipeline, pipeline);
        }
    }

    #[test]
    fn test_degraded_only_from_open_link() {
        let next = transition(
            States::new(PipelineState::Streaming, LinkState::Connected),
            StateEvent::LinkFaulted,
        )
        .unwrap();
        assert_eq!(next, States::new(PipelineState::Streaming, LinkState::Degraded));

        let next = transition(
            States::new(PipelineState::CaptureOnly, LinkState::Connecting),
            StateEvent::LinkFaulted,
        )
        .unwrap();
        assert_eq!(next.link, LinkState::Disconnected);

        let recovered = transition(
            States::new(PipelineState::Streaming, LinkState::Degraded),
            StateEvent::LinkRecovered,
        )
        .unwrap();
        assert_eq!(recovered.link, LinkState::Connected);
    }

    #[test]
    fn test_connect_only_from_disconnected() {
        let idle = States::default();
        let connecting = transition(idle, StateEvent::LinkConnecting).unwrap();
        assert_eq!(connecting.link, LinkState::Connecting);
        assert!(matches!(
            transition(connecting, StateEvent::LinkConnecting),
            Err(PreconditionError::LinkBusy { .. })
        ));
        assert!(transition(idle, StateEvent::LinkConnected).is_err());
    }

    #[test]
    fn test_release_always_lands_idle() {
        for pipeline in PIPELINES {
            let next = transition(States::new(pipeline, LinkState::Connected), StateEvent::CaptureReleased)
                .unwrap();
            assert_eq!(next.pipeline, PipelineState::Idle);
        }
        assert!(transition(
            States::new(PipelineState::CaptureOnly, LinkState::Disconnected),
            StateEvent::CaptureAcquired
        )
        .is_err());
    }
}
