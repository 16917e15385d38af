//! End-to-end scenarios from the design doc's testable-properties section,
//! driven against fake browser/codec/transport collaborators so no real
//! browser or network connection is involved.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use webview_tile_streamer::broadcaster::ClientConn;
use webview_tile_streamer::browser::FakeBrowser;
use webview_tile_streamer::codec::Codec;
use webview_tile_streamer::config::{DeviceConfig, ServerConfig};
use webview_tile_streamer::error::CoreResult;
use webview_tile_streamer::frame::RgbaRaster;
use webview_tile_streamer::protocol::LengthPrefixedEncoder;
use webview_tile_streamer::registry::ServerState;

/// Decodes the first byte of the "PNG" as a solid fill value, so distinct
/// fake payloads decode to distinct rasters without real image parsing.
struct FillCodec {
    width: u32,
    height: u32,
}

impl Codec for FillCodec {
    fn decode_png(&self, data: &[u8], _rotation_degrees: u16) -> CoreResult<RgbaRaster> {
        let fill = data.first().copied().unwrap_or(0);
        Ok(RgbaRaster::new(vec![fill; self.width as usize * self.height as usize * 4], self.width, self.height))
    }

    fn encode_jpeg(&self, _raster: &RgbaRaster, _x: u32, _y: u32, w: u32, h: u32, _quality: u8) -> CoreResult<Vec<u8>> {
        Ok(vec![0xAB; (w * h) as usize])
    }
}

struct RecordingClient {
    id: u64,
    closed: AtomicBool,
    buffered: AtomicUsize,
    frames_received: Mutex<Vec<Bytes>>,
}

impl RecordingClient {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            closed: AtomicBool::new(false),
            buffered: AtomicUsize::new(0),
            frames_received: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ClientConn for RecordingClient {
    fn id(&self) -> u64 {
        self.id
    }
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }
    async fn send_binary(&self, data: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        self.frames_received.lock().await.push(data);
        true
    }
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn test_server_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        idle_ttl_secs: 300,
        idle_sweep_secs: 60,
        log_filter: "info".into(),
        prefers_reduced_motion: false,
    }
}

fn small_device_config() -> DeviceConfig {
    DeviceConfig {
        width: 16,
        height: 16,
        tile_size: 8,
        min_frame_interval: Duration::from_millis(20),
        ..DeviceConfig::default()
    }
}

#[tokio::test]
async fn new_client_receives_a_full_frame_first() {
    let state = ServerState::new(
        test_server_config(),
        Arc::new(FakeBrowser::new()),
        Arc::new(FillCodec { width: 16, height: 16 }),
        Arc::new(LengthPrefixedEncoder),
    );
    state.ensure_device("dev", small_device_config()).await.unwrap();

    let broadcaster = state.broadcaster();
    let client = RecordingClient::new(1);
    broadcaster.add_client("dev", client.clone()).await;

    broadcaster.start_self_test_measurement("dev").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!client.frames_received.lock().await.is_empty());
}

#[tokio::test]
async fn reconfigure_mid_stream_rebuilds_the_session_once() {
    let state = ServerState::new(
        test_server_config(),
        Arc::new(FakeBrowser::new()),
        Arc::new(FillCodec { width: 16, height: 16 }),
        Arc::new(LengthPrefixedEncoder),
    );
    state.ensure_device("dev", small_device_config()).await.unwrap();
    assert_eq!(state.device_count().await, 1);

    let mut reconfigured = small_device_config();
    reconfigured.width = 32;
    state.ensure_device("dev", reconfigured).await.unwrap();

    assert_eq!(state.device_count().await, 1);
}

#[tokio::test]
async fn zero_clients_means_no_frame_is_broadcast() {
    let state = ServerState::new(
        test_server_config(),
        Arc::new(FakeBrowser::new()),
        Arc::new(FillCodec { width: 16, height: 16 }),
        Arc::new(LengthPrefixedEncoder),
    );
    state.ensure_device("dev", small_device_config()).await.unwrap();

    let broadcaster = state.broadcaster();
    assert_eq!(broadcaster.client_count("dev").await, 0);

    // No client registered: start_self_test_measurement must be a no-op, not
    // a panic or a leaked queue.
    broadcaster.start_self_test_measurement("dev").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(broadcaster.client_count("dev").await, 0);
}

#[tokio::test]
async fn idle_eviction_removes_a_stale_session() {
    let state = ServerState::new(test_server_config(), Arc::new(FakeBrowser::new()), Arc::new(FillCodec { width: 16, height: 16 }), Arc::new(LengthPrefixedEncoder));
    state.ensure_device("dev", small_device_config()).await.unwrap();
    assert_eq!(state.device_count().await, 1);

    // TTL of zero: the session is immediately "stale" relative to its
    // creation-time last-active stamp.
    state.cleanup_idle(Duration::from_millis(0)).await;
    assert_eq!(state.device_count().await, 0);
}

#[tokio::test]
async fn concurrent_cleanup_runs_do_not_double_destroy() {
    let state = ServerState::new(test_server_config(), Arc::new(FakeBrowser::new()), Arc::new(FillCodec { width: 16, height: 16 }), Arc::new(LengthPrefixedEncoder));
    state.ensure_device("dev", small_device_config()).await.unwrap();

    let a = state.clone();
    let b = state.clone();
    let (r1, r2) = tokio::join!(a.cleanup_idle(Duration::from_millis(0)), b.cleanup_idle(Duration::from_millis(0)));
    let _ = (r1, r2);

    assert_eq!(state.device_count().await, 0);
}
