// 帧率控制器
//
// Turns a target rate into a cooperative tick schedule. The ticker is an
// owned task with its own cancellation token; the in-flight flag lives here
// so that restarting the ticker never lets two ticks overlap.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Upper bound used until a backend advertises its own.
pub const DEFAULT_MAX_FPS: u32 = 30;

/// A tick admitted by the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub seq: u64,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GovernorCounters {
    /// Ticks handed to the pipeline.
    pub fired: u64,
    /// Ticks dropped because the previous one was still in flight.
    pub skipped: u64,
}

struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    ticks: mpsc::Receiver<Instant>,
}

impl Ticker {
    /// First tick at `start`, then one every `period`.
    fn spawn(start: Instant, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let (tx, ticks) = mpsc::channel(1);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut timer = interval_at(start, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    at = timer.tick() => {
                        // 槽位已满：上一个 tick 还没被取走
                        if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(at) {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            cancel,
            handle,
            ticks,
        }
    }

    fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

pub struct RateGovernor {
    rate: u32,
    ceiling: u32,
    ticker: Option<Ticker>,
    in_flight: bool,
    seq: u64,
    /// Instant of the last admitted tick.
    last_fired: Option<Instant>,
    counters: GovernorCounters,
}

impl RateGovernor {
    pub fn new(rate: u32) -> Self {
        let ceiling = DEFAULT_MAX_FPS;
        Self {
            rate: rate.clamp(1, ceiling),
            ceiling,
            ticker: None,
            in_flight: false,
            seq: 0,
            last_fired: None,
            counters: GovernorCounters::default(),
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate as f64)
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn counters(&self) -> GovernorCounters {
        self.counters
    }

    /// Applies a requested rate, clamped to `1..=ceiling`. Returns the
    /// effective rate.
    pub fn set_rate(&mut self, requested: u32) -> u32 {
        let effective = requested.clamp(1, self.ceiling);
        if effective != requested {
            debug!("Requested {} fps clamped to {} fps", requested, effective);
        }
        if effective != self.rate {
            info!("Target rate: {} -> {} fps", self.rate, effective);
            self.rate = effective;
            if self.ticker.is_some() {
                self.restart();
            }
        }
        effective
    }

    /// Lowers (or raises) the ceiling, e.g. when a backend advertises its
    /// `max_fps`. The current rate is re-clamped against `requested`.
    pub fn set_ceiling(&mut self, ceiling: u32, requested: u32) -> u32 {
        self.ceiling = ceiling.max(1);
        self.set_rate(requested)
    }

    pub fn start(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        info!("🎬 Governor started at {} fps ({:?} period)", self.rate, self.period());
        self.ticker = Some(Ticker::spawn(Instant::now(), self.period()));
    }

    /// Stops the ticker. Stopping a stopped governor is a no-op. A tick that
    /// is already in flight stays marked until [`complete`](Self::complete).
    pub fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop();
            info!(
                "⏹️ Governor stopped (fired: {}, skipped: {})",
                self.counters.fired, self.counters.skipped
            );
        }
    }

    /// 重建定时器：下一次 tick 距上一次至少一个新周期
    fn restart(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop();
        }
        let period = self.period();
        let start = self
            .last_fired
            .map(|at| at + period)
            .unwrap_or_else(|| Instant::now() + period);
        self.ticker = Some(Ticker::spawn(start, period));
    }

    /// Waits for the next admitted tick. Never resolves while stopped.
    ///
    /// Cancel safe: dropping the future loses no admitted tick.
    pub async fn next_tick(&mut self) -> Tick {
        loop {
            let Some(ticker) = self.ticker.as_mut() else {
                return std::future::pending().await;
            };

            let Some(at) = ticker.ticks.recv().await else {
                self.ticker = None;
                continue;
            };

            if self.in_flight {
                self.counters.skipped += 1;
                trace!("Tick skipped, previous frame still in flight");
                continue;
            }

            self.in_flight = true;
            self.last_fired = Some(at);
            self.seq += 1;
            self.counters.fired += 1;
            return Tick { seq: self.seq, at };
        }
    }

    /// Marks the in-flight tick as finished.
    pub fn complete(&mut self) {
        self.in_flight = false;
    }
}

impl Drop for RateGovernor {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop();
        }
    }
}
