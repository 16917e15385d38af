//! Per-device WebSocket upgrade handler. Parses a [`DeviceConfig`] from the
//! upgrade request's query string, ensures the device session exists, and
//! wires the accepted socket into the broadcaster as a [`ClientConn`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::broadcaster::ClientConn;
use crate::config::{DeviceConfig, Rotation};
use crate::registry::ServerState;

/// Query-string shape for `GET /ws/:device_id?width=...&height=...`. Fields
/// absent from the request fall back to `DeviceConfig::default()`.
#[derive(Debug, Deserialize)]
pub struct DeviceParams {
    width: Option<u32>,
    height: Option<u32>,
    tile_size: Option<u32>,
    rotation: Option<u16>,
    jpeg_quality: Option<u8>,
    full_frame_tile_count: Option<u32>,
    full_frame_area_threshold: Option<f32>,
    full_frame_every: Option<u32>,
    every_nth_frame: Option<u32>,
    min_frame_interval_ms: Option<u64>,
    max_bytes_per_message: Option<usize>,
}

impl DeviceParams {
    fn into_config(self) -> Result<DeviceConfig, Response> {
        let defaults = DeviceConfig::default();
        let rotation = match self.rotation {
            Some(deg) => Rotation::from_degrees(deg)
                .map_err(|e| (axum::http::StatusCode::BAD_REQUEST, e.to_string()).into_response())?,
            None => defaults.rotation,
        };
        let config = DeviceConfig {
            width: self.width.unwrap_or(defaults.width),
            height: self.height.unwrap_or(defaults.height),
            tile_size: self.tile_size.unwrap_or(defaults.tile_size),
            rotation,
            jpeg_quality: self.jpeg_quality.unwrap_or(defaults.jpeg_quality),
            full_frame_tile_count: self.full_frame_tile_count.unwrap_or(defaults.full_frame_tile_count),
            full_frame_area_threshold: self
                .full_frame_area_threshold
                .unwrap_or(defaults.full_frame_area_threshold),
            full_frame_every: self.full_frame_every.unwrap_or(defaults.full_frame_every),
            every_nth_frame: self.every_nth_frame.unwrap_or(defaults.every_nth_frame),
            min_frame_interval: self
                .min_frame_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.min_frame_interval),
            max_bytes_per_message: self.max_bytes_per_message.unwrap_or(defaults.max_bytes_per_message),
        };
        config
            .validate()
            .map_err(|e| (axum::http::StatusCode::BAD_REQUEST, e.to_string()).into_response())?;
        Ok(config)
    }
}

pub async fn upgrade(
    Path(device_id): Path<String>,
    Query(params): Query<DeviceParams>,
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let config = match params.into_config() {
        Ok(config) => config,
        Err(resp) => return resp,
    };

    if let Err(e) = state.ensure_device(&device_id, config).await {
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    let broadcaster = state.broadcaster();
    ws.on_upgrade(move |socket| async move {
        let (sink, mut stream) = socket.split();
        let conn = WsClientConn::new(sink);
        broadcaster.add_client(&device_id, conn.clone()).await;

        // Drain the inbound side solely to detect client-initiated close;
        // the protocol carries no meaningful client->server payloads.
        while let Some(Ok(msg)) = stream.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
        conn.mark_closed();
        broadcaster.remove_client(&device_id, conn.id()).await;
    })
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(0);

/// Adapts an Axum WebSocket sink to [`ClientConn`]. `buffered_amount` is a
/// server-tracked estimate (axum/WebSocket expose no kernel buffer depth):
/// it counts bytes handed to `send` that haven't finished flushing yet.
pub struct WsClientConn {
    id: u64,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    closed: AtomicBool,
    buffered: AtomicUsize,
}

impl WsClientConn {
    fn new(sink: SplitSink<WebSocket, Message>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            buffered: AtomicUsize::new(0),
        })
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClientConn for WsClientConn {
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
        let len = data.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        let mut sink = self.sink.lock().await;
        let result = sink.send(Message::Binary(data.to_vec())).await;
        drop(sink);
        self.buffered.fetch_sub(len, Ordering::SeqCst);

        if result.is_err() {
            self.mark_closed();
            false
        } else {
            true
        }
    }

    async fn close(&self) {
        self.mark_closed();
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }
}
