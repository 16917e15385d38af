//! Per-device client registry and delivery pacing. Owns the FIFO of
//! [`OutFrame`]s and the single drain task that paces delivery against a
//! slow, bufferbloat-prone transport.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::protocol::ProtocolEncoder;

const MIN_FRAME_GAP: Duration = Duration::from_millis(100);
const DRAIN_MAX: Duration = Duration::from_millis(2000);
const DRAIN_POLL: Duration = Duration::from_millis(5);
const BACKPRESSURE_LOW: usize = 16 * 1024;

/// Reserved frame id for self-test measurement packets; never produced by
/// normal frame advancement (see [`crate::frame::FrameId::self_test`]).
pub const SELF_TEST_FRAME_ID: u32 = u32::MAX;

/// A single connected client. The transport layer (`transport::ws`) adapts an
/// Axum WebSocket into this trait; tests use an in-memory fake.
#[async_trait]
pub trait ClientConn: Send + Sync {
    fn id(&self) -> u64;
    fn is_closed(&self) -> bool;
    /// Estimated pending outbound bytes, tracked server-side since WebSocket
    /// itself exposes no kernel buffer depth.
    fn buffered_amount(&self) -> usize;
    async fn send_binary(&self, data: Bytes) -> bool;
    async fn close(&self);
}

struct OutFrame {
    packets: Vec<Bytes>,
}

#[derive(Default)]
struct DeviceState {
    clients: Vec<Arc<dyn ClientConn>>,
    queue: VecDeque<OutFrame>,
    draining: bool,
}

/// Broadcasts paced, packetized frames to the clients of each device.
pub struct Broadcaster {
    devices: Arc<Mutex<HashMap<String, DeviceState>>>,
    encoder: Arc<dyn ProtocolEncoder>,
    // Lets `&self` methods spawn the drain task without requiring callers to
    // hold an `Arc<Broadcaster>` at the call site (`self: &Arc<Self>` isn't a
    // receiver stable Rust accepts).
    self_weak: Weak<Broadcaster>,
}

impl Broadcaster {
    pub fn new(encoder: Arc<dyn ProtocolEncoder>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            devices: Arc::new(Mutex::new(HashMap::new())),
            encoder,
            self_weak: weak.clone(),
        })
    }

    /// Registers `conn` for `device_id`. Any previously connected clients for
    /// this device are closed first (one-display-one-viewer semantics).
    pub async fn add_client(&self, device_id: &str, conn: Arc<dyn ClientConn>) {
        let mut devices = self.devices.lock().await;
        let state = devices.entry(device_id.to_string()).or_default();
        for old in state.clients.drain(..) {
            old.close().await;
        }
        state.clients.push(conn);
    }

    pub async fn remove_client(&self, device_id: &str, conn_id: u64) {
        let mut devices = self.devices.lock().await;
        if let Some(state) = devices.get_mut(device_id) {
            state.clients.retain(|c| c.id() != conn_id);
            if state.clients.is_empty() {
                devices.remove(device_id);
            }
        }
    }

    pub async fn client_count(&self, device_id: &str) -> usize {
        let devices = self.devices.lock().await;
        devices.get(device_id).map(|s| s.clients.len()).unwrap_or(0)
    }

    /// Packetizes `frame` and enqueues it, starting the drain task if one
    /// isn't already running for this device.
    pub async fn send_frame_chunked(
        &self,
        device_id: &str,
        frame: &crate::frame::FrameOut,
        frame_id: u32,
        max_bytes: usize,
    ) {
        if frame.is_empty() {
            return;
        }
        let packets = self.encoder.build_frame_packets(frame, frame_id, max_bytes);
        self.enqueue(device_id, OutFrame { packets }).await;
    }

    /// Enqueues a distinguished single-packet stats frame under the reserved
    /// self-test frame id.
    pub async fn start_self_test_measurement(&self, device_id: &str) {
        let packet = self.encoder.build_frame_stats_packet(SELF_TEST_FRAME_ID, 0);
        self.enqueue(device_id, OutFrame { packets: vec![packet] }).await;
    }

    async fn enqueue(&self, device_id: &str, frame: OutFrame) {
        let mut start_drain = false;
        {
            let mut devices = self.devices.lock().await;
            let Some(state) = devices.get_mut(device_id) else {
                return; // no clients registered for this device; nothing to deliver
            };
            if state.clients.is_empty() {
                return;
            }
            state.queue.push_back(frame);
            if !state.draining {
                state.draining = true;
                start_drain = true;
            }
        }
        if start_drain {
            if let Some(this) = self.self_weak.upgrade() {
                let device_id = device_id.to_string();
                tokio::spawn(async move { this.drain(device_id).await });
            }
        }
    }

    async fn drain(self: Arc<Self>, device_id: String) {
        loop {
            let frame = {
                let mut devices = self.devices.lock().await;
                let Some(state) = devices.get_mut(&device_id) else {
                    return;
                };
                // Stale-frame dropping: keep only the newest queued frame.
                while state.queue.len() > 1 {
                    state.queue.pop_front();
                }
                let Some(frame) = state.queue.pop_front() else {
                    state.draining = false;
                    return;
                };
                frame
            };

            let mut aborted = false;
            for packet in &frame.packets {
                if self.newer_frame_waiting(&device_id).await {
                    aborted = true;
                    break;
                }
                if !self.deliver_to_clients(&device_id, packet.clone()).await {
                    // client set emptied mid-send
                    return;
                }
                tokio::task::yield_now().await;
            }
            if aborted {
                continue;
            }

            if !self.pace_after_frame(&device_id).await {
                return;
            }
        }
    }

    async fn newer_frame_waiting(&self, device_id: &str) -> bool {
        let devices = self.devices.lock().await;
        devices.get(device_id).map(|s| !s.queue.is_empty()).unwrap_or(false)
    }

    /// Sends `packet` to every open client of `device_id`, pruning closed or
    /// errored connections. Returns `false` if the client set is now empty
    /// (caller should clear the queue and stop draining).
    async fn deliver_to_clients(&self, device_id: &str, packet: Bytes) -> bool {
        let snapshot = {
            let devices = self.devices.lock().await;
            match devices.get(device_id) {
                Some(state) => state.clients.clone(),
                None => return false,
            }
        };

        let mut dead = Vec::new();
        for client in &snapshot {
            if client.is_closed() || !client.send_binary(packet.clone()).await {
                dead.push(client.clone());
            }
        }

        for client in &dead {
            client.close().await;
        }

        let mut devices = self.devices.lock().await;
        let Some(state) = devices.get_mut(device_id) else {
            return false;
        };
        if !dead.is_empty() {
            let dead_ids: Vec<u64> = dead.iter().map(|c| c.id()).collect();
            state.clients.retain(|c| !dead_ids.contains(&c.id()));
        }
        if state.clients.is_empty() {
            state.queue.clear();
            state.draining = false;
            devices.remove(device_id);
            return false;
        }
        true
    }

    /// Sleeps the fixed inter-frame gap, then polls buffer drain up to the
    /// hard cap. Returns `false` if the device was torn down mid-wait.
    async fn pace_after_frame(&self, device_id: &str) -> bool {
        tokio::time::sleep(MIN_FRAME_GAP).await;

        let deadline = tokio::time::Instant::now() + DRAIN_MAX;
        loop {
            let devices = self.devices.lock().await;
            let Some(state) = devices.get(device_id) else {
                return false;
            };
            if !state.queue.is_empty() {
                return true; // newer frame arrived, skip remaining pacing
            }
            let backed_up = state.clients.iter().any(|c| c.buffered_amount() > BACKPRESSURE_LOW);
            drop(devices);

            if !backed_up || tokio::time::Instant::now() >= deadline {
                return true;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}
