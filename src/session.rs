//! A single device's frame pipeline: browser target ownership, the
//! screencast/fallback event loop, throttling, and the hand-off to the
//! broadcaster. The single-consumer [`SessionEvent`] loop replaces the
//! nested-callback control flow the original design grew.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broadcaster::Broadcaster;
use crate::browser::{BrowserControl, BrowserEvent, BrowserSessionId, EmulatedMedia, TargetId, Viewport};
use crate::codec::Codec;
use crate::config::DeviceConfig;
use crate::error::CoreResult;
use crate::frame::FrameId;
use crate::hash::fnv1a32;
use crate::processing::FrameProcessor;

const FALLBACK_DELAY: Duration = Duration::from_millis(800);
const FALLBACK_REPEAT: Duration = Duration::from_millis(2000);
const FALLBACK_IDLE_RECHECK: Duration = Duration::from_secs(5);

/// Events consumed by a session's single-owner task. Producers (browser
/// callbacks, timers) only ever push onto the channel; the task itself is the
/// sole mutator of session state (§9 redesign flag: callback-driven control
/// flow).
#[derive(Debug)]
pub enum SessionEvent {
    ScreencastFrame { data: Bytes, #[allow(dead_code)] timestamp_ms: f64 },
    Screenshot { data: Bytes },
    MutationHint,
    /// A client joined an existing, config-equal session: latch a one-shot
    /// full-frame request (§4.4 creation step, "joining an existing session
    /// requests an immediate full frame").
    JoinRequestsFullFrame,
    ThrottleTick,
    FallbackTick,
    Shutdown,
}

/// A cancellable timer handle. Aborts its task on drop or on being replaced,
/// so a session never accumulates more than one outstanding timer of a kind.
pub struct TimerToken {
    handle: JoinHandle<()>,
}

impl TimerToken {
    fn arm(delay: Duration, tx: mpsc::Sender<SessionEvent>, event: SessionEvent) -> Self {
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send(event).await;
        });
        Self { handle }
    }
}

impl Drop for TimerToken {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Handle a caller outside the session task uses to talk to it: send events,
/// read cheap published state, and request shutdown.
pub struct SessionHandle {
    pub device_id: String,
    tx: mpsc::Sender<SessionEvent>,
    last_active_ms: Arc<AtomicU64>,
    started_at: Instant,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub async fn send(&self, event: SessionEvent) {
        let _ = self.tx.send(event).await;
    }

    pub fn last_active(&self) -> Instant {
        let elapsed_ms = self.last_active_ms.load(Ordering::Relaxed);
        self.started_at + Duration::from_millis(elapsed_ms)
    }

    pub async fn shutdown(self) {
        let _ = self.tx.send(SessionEvent::Shutdown).await;
        let _ = self.task.await;
    }
}

/// Spawns a new device session task and returns a handle to it. Mirrors
/// `ensure_device`'s creation steps 1-5.
pub async fn spawn_session(
    device_id: String,
    config: DeviceConfig,
    browser: Arc<dyn BrowserControl>,
    codec: Arc<dyn Codec>,
    broadcaster: Arc<Broadcaster>,
    prefers_reduced_motion: bool,
) -> CoreResult<SessionHandle> {
    let current_url = "about:blank".to_string();
    let viewport = Viewport { width: config.width, height: config.height };
    let target = browser.create_target(&current_url, viewport).await?;
    let browser_session = browser.attach_session(&target).await?;
    browser.enable_page_events(&browser_session).await?;
    browser.set_device_metrics_override(&browser_session, viewport).await?;
    let media = if prefers_reduced_motion {
        EmulatedMedia::PrefersReducedMotionReduce
    } else {
        EmulatedMedia::None
    };
    browser.set_emulated_media(&browser_session, media).await?;
    browser.start_screencast(&browser_session, viewport, config.every_nth_frame).await?;
    let mut browser_events = browser.subscribe_events(&browser_session).await?;

    let (tx, rx) = mpsc::channel(64);
    let started_at = Instant::now();
    let last_active_ms = Arc::new(AtomicU64::new(0));

    // step 4: FrameProcessor starts with a latched full-frame request (its own `new`).
    let processor = FrameProcessor::new(config.clone(), codec.clone());

    let mut session = DeviceSession {
        device_id: device_id.clone(),
        target,
        browser_session,
        current_url,
        config,
        processor,
        codec,
        browser,
        broadcaster,
        frame_id: FrameId::zero(),
        prev_frame_hash: None,
        pending: None,
        throttle_timer: None,
        fallback_timer: None,
        last_processed: Instant::now(),
        processing: false,
        last_active_ms: last_active_ms.clone(),
        started_at,
        tx: tx.clone(),
        rx,
        event_pump: None,
    };
    // step 5: subscribe to screencast-frame/DOM-change events; start the fallback timer.
    let pump_tx = tx.clone();
    let event_pump = tokio::spawn(async move {
        while let Some(event) = browser_events.recv().await {
            let mapped = match event {
                BrowserEvent::ScreencastFrame { data, timestamp_ms, .. } => {
                    SessionEvent::ScreencastFrame { data, timestamp_ms }
                }
                BrowserEvent::MutationHint => SessionEvent::MutationHint,
                BrowserEvent::TargetCrashed => SessionEvent::Shutdown,
            };
            if pump_tx.send(mapped).await.is_err() {
                break;
            }
        }
    });
    session.event_pump = Some(event_pump);
    session.touch();
    session.arm_fallback(FALLBACK_DELAY);

    let task = tokio::spawn(session.run());

    Ok(SessionHandle { device_id, tx, last_active_ms, started_at, task })
}

struct DeviceSession {
    device_id: String,
    #[allow(dead_code)]
    target: TargetId,
    browser_session: BrowserSessionId,
    // No in-scope operation navigates past the initial target creation, so
    // this never changes after construction; kept as a field per the
    // recorded data model rather than a local that vanishes after spawn.
    #[allow(dead_code)]
    current_url: String,
    config: DeviceConfig,
    processor: FrameProcessor,
    codec: Arc<dyn Codec>,
    browser: Arc<dyn BrowserControl>,
    broadcaster: Arc<Broadcaster>,

    frame_id: FrameId,
    prev_frame_hash: Option<u32>,
    pending: Option<Bytes>,
    throttle_timer: Option<TimerToken>,
    fallback_timer: Option<TimerToken>,
    last_processed: Instant,
    processing: bool,

    last_active_ms: Arc<AtomicU64>,
    started_at: Instant,
    tx: mpsc::Sender<SessionEvent>,
    rx: mpsc::Receiver<SessionEvent>,
    event_pump: Option<JoinHandle<()>>,
}

impl DeviceSession {
    fn touch(&self) {
        let elapsed = self.started_at.elapsed().as_millis() as u64;
        self.last_active_ms.store(elapsed, Ordering::Relaxed);
    }

    async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            match event {
                SessionEvent::ScreencastFrame { data, .. } => self.on_screencast_frame(data).await,
                SessionEvent::Screenshot { data } => self.on_screenshot(data).await,
                SessionEvent::MutationHint => self.on_mutation_hint().await,
                SessionEvent::JoinRequestsFullFrame => self.processor.request_full_frame(),
                SessionEvent::ThrottleTick => self.flush_pending().await,
                SessionEvent::FallbackTick => self.on_fallback_tick().await,
                SessionEvent::Shutdown => break,
            }
        }
        self.destroy().await;
    }

    async fn on_screencast_frame(&mut self, data: Bytes) {
        // Ack immediately so the producer keeps pushing; failures are
        // logged, never propagated.
        if let Err(e) = self.browser.screencast_frame_ack(&self.browser_session).await {
            tracing::debug!(device = %self.device_id, error = %e, "screencast ack failed");
        }
        self.arm_fallback(FALLBACK_DELAY);

        if self.broadcaster.client_count(&self.device_id).await == 0 {
            return;
        }

        self.touch();
        self.pending = Some(data);
        self.arm_throttle_if_needed();
    }

    async fn on_screenshot(&mut self, data: Bytes) {
        self.processor.request_full_frame();
        self.pending = Some(data);
        self.arm_throttle_now();
    }

    async fn on_mutation_hint(&mut self) {
        // Cuts the fallback idle wait short: trigger a fallback capture now.
        self.fallback_timer = None;
        self.do_fallback_capture().await;
    }

    fn arm_throttle_if_needed(&mut self) {
        if self.throttle_timer.is_some() {
            return;
        }
        let elapsed = self.last_processed.elapsed();
        let delay = self.config.min_frame_interval.saturating_sub(elapsed);
        self.arm_throttle(delay);
    }

    fn arm_throttle_now(&mut self) {
        self.arm_throttle(Duration::ZERO);
    }

    fn arm_throttle(&mut self, delay: Duration) {
        self.throttle_timer =
            Some(TimerToken::arm(delay, self.tx.clone(), SessionEvent::ThrottleTick));
    }

    fn arm_fallback(&mut self, delay: Duration) {
        self.fallback_timer =
            Some(TimerToken::arm(delay, self.tx.clone(), SessionEvent::FallbackTick));
    }

    async fn flush_pending(&mut self) {
        self.throttle_timer = None;

        if self.processing {
            self.arm_throttle(self.config.min_frame_interval);
            return;
        }

        let Some(data) = self.pending.take() else {
            return;
        };

        self.processing = true;
        self.process_one(data).await;
        self.processing = false;
        self.last_processed = Instant::now();
        self.touch();

        if self.pending.is_some() && self.throttle_timer.is_none() {
            self.arm_throttle_now();
        }
    }

    async fn process_one(&mut self, data: Bytes) {
        let hash = fnv1a32(&data);
        if Some(hash) == self.prev_frame_hash {
            return; // identical consecutive frame: dropped before decode
        }
        self.prev_frame_hash = Some(hash);

        let rotation_degrees = match self.config.rotation {
            crate::config::Rotation::None => 0,
            crate::config::Rotation::Deg90 => 90,
            crate::config::Rotation::Deg180 => 180,
            crate::config::Rotation::Deg270 => 270,
        };

        let raster = match self.codec.decode_png(&data, rotation_degrees) {
            Ok(raster) => raster,
            Err(e) => {
                tracing::warn!(device = %self.device_id, error = %e, "frame decode failed");
                return;
            }
        };

        let out = self.processor.process_frame(&raster);
        if out.is_empty() {
            return;
        }

        self.frame_id = self.frame_id.next();
        self.broadcaster
            .send_frame_chunked(
                &self.device_id,
                &out,
                self.frame_id.as_u32(),
                self.config.max_bytes_per_message,
            )
            .await;
    }

    async fn on_fallback_tick(&mut self) {
        self.fallback_timer = None;
        self.do_fallback_capture().await;
    }

    async fn do_fallback_capture(&mut self) {
        if self.broadcaster.client_count(&self.device_id).await == 0 {
            self.arm_fallback(FALLBACK_IDLE_RECHECK);
            return;
        }

        match self.browser.capture_screenshot(&self.browser_session).await {
            Ok(data) => {
                let _ = self.tx.send(SessionEvent::Screenshot { data }).await;
                self.arm_fallback(FALLBACK_REPEAT);
            }
            Err(e) => {
                tracing::debug!(device = %self.device_id, error = %e, "fallback screenshot failed");
                // Unrecoverable target errors: do not re-arm.
            }
        }
    }

    async fn destroy(mut self) {
        self.throttle_timer = None;
        self.fallback_timer = None;
        if let Some(pump) = self.event_pump.take() {
            pump.abort();
        }
        if let Err(e) = self.browser.stop_screencast(&self.browser_session).await {
            tracing::debug!(device = %self.device_id, error = %e, "stop_screencast failed");
        }
        if let Err(e) = self.browser.close_target(&self.target).await {
            tracing::warn!(device = %self.device_id, error = %e, "close_target failed");
        }
    }
}
