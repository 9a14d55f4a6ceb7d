use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serenity::client::bridge::gateway::ShardManager;
use songbird::Call;

/// Gain applied to every (re)started track.
pub const DEFAULT_VOLUME: f32 = 0.1;

/// Shared context handed to every task and event handler. The call handle
/// is the only field several tasks race to read-and-replace; everything
/// else has a single writer.
pub struct BotState {
    started_at: OnceLock<Instant>,
    status_index: AtomicUsize,
    volume: f32,
    current_call: Mutex<Option<Arc<tokio::sync::Mutex<Call>>>>,
    expected_disconnects: AtomicU32,
    shard_manager: OnceLock<Arc<tokio::sync::Mutex<ShardManager>>>,
}

impl BotState {
    pub fn new(volume: f32) -> Self {
        BotState {
            started_at: OnceLock::new(),
            status_index: AtomicUsize::new(0),
            volume,
            current_call: Mutex::new(None),
            expected_disconnects: AtomicU32::new(0),
            shard_manager: OnceLock::new(),
        }
    }

    /// Records the start instant. Later calls (a gateway resume re-delivers
    /// `ready`) keep the first instant.
    pub fn mark_ready(&self) {
        let _ = self.started_at.set(Instant::now());
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.get().map(Instant::elapsed)
    }

    pub fn uptime_string(&self) -> String {
        self.uptime()
            .map(format_uptime)
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_call(&self, call: Arc<tokio::sync::Mutex<Call>>) {
        *self.current_call.lock() = Some(call);
    }

    /// Clones the handle out so the lock is never held across an await.
    pub fn current_call(&self) -> Option<Arc<tokio::sync::Mutex<Call>>> {
        self.current_call.lock().clone()
    }

    pub async fn connection_live(&self) -> bool {
        match self.current_call() {
            Some(call) => call.lock().await.current_connection().is_some(),
            None => false,
        }
    }

    /// Announces an intentional teardown, so the voice-state handler can
    /// tell it apart from an external kick.
    pub fn expect_disconnect(&self) {
        self.expected_disconnects.fetch_add(1, Ordering::SeqCst);
    }

    pub fn consume_expected_disconnect(&self) -> bool {
        self.expected_disconnects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Returns the current status cursor and advances it modulo `len`.
    /// Single writer: only the presence rotator calls this.
    pub fn next_status(&self, len: usize) -> usize {
        let index = self.status_index.load(Ordering::Relaxed) % len;
        self.status_index.store((index + 1) % len, Ordering::Relaxed);
        index
    }

    pub fn set_shard_manager(&self, manager: Arc<tokio::sync::Mutex<ShardManager>>) {
        let _ = self.shard_manager.set(manager);
    }

    pub fn shard_manager(&self) -> Option<&Arc<tokio::sync::Mutex<ShardManager>>> {
        self.shard_manager.get()
    }
}

pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let days = total / 86_400;
    let hours = total % 86_400 / 3_600;
    let minutes = total % 3_600 / 60;
    let seconds = total % 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
