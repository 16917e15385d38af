//! Process-wide device registry. Replaces the original source's module-level
//! singletons (§9): both the session map and the "cleanup running" guard are
//! fields on one explicit [`ServerState`], constructed at startup and threaded
//! through the transport handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::broadcaster::Broadcaster;
use crate::browser::BrowserControl;
use crate::codec::Codec;
use crate::config::{DeviceConfig, ServerConfig};
use crate::error::{CoreError, CoreResult};
use crate::protocol::ProtocolEncoder;
use crate::session::{spawn_session, SessionHandle};

struct Entry {
    handle: SessionHandle,
    config: DeviceConfig,
}

/// Owns every live device session plus the collaborators used to build new
/// ones. One instance is constructed at startup and cloned (cheaply, via
/// `Arc` fields) into every transport handler and the idle-sweep task.
pub struct ServerState {
    server_config: ServerConfig,
    sessions: Mutex<std::collections::HashMap<String, Entry>>,
    cleanup_running: AtomicBool,
    browser: Arc<dyn BrowserControl>,
    codec: Arc<dyn Codec>,
    broadcaster: Arc<Broadcaster>,
}

impl ServerState {
    pub fn new(
        server_config: ServerConfig,
        browser: Arc<dyn BrowserControl>,
        codec: Arc<dyn Codec>,
        encoder: Arc<dyn ProtocolEncoder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_config,
            sessions: Mutex::new(std::collections::HashMap::new()),
            cleanup_running: AtomicBool::new(false),
            browser,
            codec,
            broadcaster: Broadcaster::new(encoder),
        })
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    /// Returns the session for `device_id`, creating or rebuilding it as
    /// needed. A config-equal request against an existing session is a no-op
    /// except for latching a full-frame request (new clients always get a
    /// full frame first); a config-mismatched request destroys and recreates.
    pub async fn ensure_device(&self, device_id: &str, config: DeviceConfig) -> CoreResult<()> {
        config.validate()?;
        if !self.browser.is_ready() {
            return Err(CoreError::BrowserNotReady);
        }

        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get(device_id) {
            if entry.config == config {
                entry.handle.send(crate::session::SessionEvent::JoinRequestsFullFrame).await;
                return Ok(());
            }
        }
        if let Some(entry) = sessions.remove(device_id) {
            drop(sessions);
            entry.handle.shutdown().await;
            sessions = self.sessions.lock().await;
        }

        let handle = spawn_session(
            device_id.to_string(),
            config.clone(),
            self.browser.clone(),
            self.codec.clone(),
            self.broadcaster.clone(),
            self.server_config.prefers_reduced_motion,
        )
        .await?;

        sessions.insert(device_id.to_string(), Entry { handle, config });
        Ok(())
    }

    pub async fn device_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Destroys every session whose last-active instant is older than `ttl`.
    /// A guard flag prevents overlapping sweep runs (§9's
    /// `IdleCleanupReentrance`): a sweep that finds one already in progress
    /// returns immediately rather than racing it.
    pub async fn cleanup_idle(&self, ttl: Duration) {
        if self.cleanup_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let stale: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, entry)| entry.handle.last_active().elapsed() >= ttl)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in stale {
            let mut sessions = self.sessions.lock().await;
            if let Some(entry) = sessions.remove(&id) {
                drop(sessions);
                entry.handle.shutdown().await;
            }
        }

        self.cleanup_running.store(false, Ordering::SeqCst);
    }

    /// Spawns the periodic idle-sweep task. External to the Core's own event
    /// loop, per §4.5.
    pub fn spawn_idle_sweep(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let ttl = self.server_config.idle_ttl();
        let interval = self.server_config.idle_sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.cleanup_idle(ttl).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::FakeBrowser;
    use crate::codec::Codec;
    use crate::error::CoreResult;
    use crate::frame::RgbaRaster;
    use crate::protocol::LengthPrefixedEncoder;

    struct NoopCodec;
    impl Codec for NoopCodec {
        fn decode_png(&self, _data: &[u8], _rotation_degrees: u16) -> CoreResult<RgbaRaster> {
            Ok(RgbaRaster::new(vec![0u8; 16 * 16 * 4], 16, 16))
        }
        fn encode_jpeg(&self, _raster: &RgbaRaster, _x: u32, _y: u32, w: u32, h: u32, _q: u8) -> CoreResult<Vec<u8>> {
            Ok(vec![0u8; (w * h) as usize])
        }
    }

    fn test_state() -> Arc<ServerState> {
        ServerState::new(
            ServerConfig {
                bind_addr: "127.0.0.1:0".into(),
                idle_ttl_secs: 300,
                idle_sweep_secs: 60,
                log_filter: "info".into(),
                prefers_reduced_motion: false,
            },
            Arc::new(FakeBrowser::new()),
            Arc::new(NoopCodec),
            Arc::new(LengthPrefixedEncoder),
        )
    }

    #[tokio::test]
    async fn ensure_device_twice_with_same_config_does_not_rebuild() {
        let state = test_state();
        let cfg = DeviceConfig::default();
        state.ensure_device("dev", cfg.clone()).await.unwrap();
        assert_eq!(state.device_count().await, 1);
        state.ensure_device("dev", cfg).await.unwrap();
        assert_eq!(state.device_count().await, 1);
    }

    #[tokio::test]
    async fn ensure_device_with_different_config_rebuilds() {
        let state = test_state();
        state.ensure_device("dev", DeviceConfig::default()).await.unwrap();
        let mut other = DeviceConfig::default();
        other.width = 800;
        state.ensure_device("dev", other).await.unwrap();
        assert_eq!(state.device_count().await, 1);
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let state = test_state();
        let mut bad = DeviceConfig::default();
        bad.width = 0;
        assert!(state.ensure_device("dev", bad).await.is_err());
    }
}
