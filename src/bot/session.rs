//! Keeps the radio stream alive. Each connection attempt runs as a
//! state-machine task tagged with a generation number; every reconnect
//! trigger in the program funnels through one supervisor channel, and a
//! task that discovers a newer generation exits at its next checkpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// How often the health check probes the voice connection.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Grace period between a forced disconnect and the rejoin attempt.
pub const REJOIN_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("guild {0} is not visible to the bot")]
    GuildNotFound(GuildId),
    #[error("voice channel {0} not found in guild")]
    ChannelNotFound(ChannelId),
    #[error("voice join failed: {0}")]
    Join(#[from] songbird::error::JoinError),
    #[error("audio source failed: {0}")]
    Source(#[from] songbird::input::error::Error),
    #[error("platform request failed: {0}")]
    Platform(#[from] serenity::Error),
    #[error("no live voice connection")]
    NotConnected,
}

/// Why a reconnect was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    Startup,
    HealthCheck,
    ForcedDisconnect,
}

/// Fixed delays driving the session state machine. Constant on purpose:
/// no backoff growth and no retry cap for the process lifetime.
#[derive(Debug, Clone, Copy)]
pub struct RetryTiming {
    /// Poll interval while a track is playing.
    pub play_poll: Duration,
    /// Pause between a natural stream end and the next playback start.
    pub replay_delay: Duration,
    /// Pause after a playback error before probing the connection.
    pub recover_delay: Duration,
}

impl Default for RetryTiming {
    fn default() -> Self {
        RetryTiming {
            play_poll: Duration::from_secs(1),
            replay_delay: Duration::from_secs(1),
            recover_delay: Duration::from_secs(5),
        }
    }
}

/// Narrow seam over the platform voice and audio plumbing, so the state
/// machine can run against a scripted stand-in under test.
#[async_trait]
pub trait VoiceBackend: Send + Sync {
    /// Resolve the configured guild and channel and establish a fresh
    /// transport session, tearing down a live predecessor first.
    async fn connect(&self) -> Result<(), SessionError>;

    /// Open the stream source, apply the gain transform and start playback.
    async fn begin_playback(&self) -> Result<(), SessionError>;

    /// True while the most recent track is still producing audio.
    async fn is_playing(&self) -> bool;

    /// True while the transport session is live.
    async fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Disconnected,
    Connecting,
    Playing,
    RecoveringFromError,
}

/// Terminal outcome of one session attempt. Running forever is the normal
/// case; ending is the exception.
#[derive(Debug)]
pub enum SessionEnd {
    /// A newer generation took over.
    Superseded,
    /// Guild/channel lookup or the voice join failed. Recovery is left to
    /// the health check and the voice-state handler.
    ConnectFailed(SessionError),
}

/// One connect-then-loop-playback attempt. Stream trouble is absorbed by
/// the `RecoveringFromError` arm; only lookup and join failures end the
/// attempt.
pub async fn run_session<B: VoiceBackend>(
    backend: Arc<B>,
    generation: u64,
    latest: Arc<AtomicU64>,
    timing: RetryTiming,
) -> SessionEnd {
    let mut state = SessionState::Disconnected;
    loop {
        if latest.load(Ordering::SeqCst) != generation {
            info!("session {} superseded, exiting", generation);
            return SessionEnd::Superseded;
        }
        state = match state {
            SessionState::Disconnected => SessionState::Connecting,
            SessionState::Connecting => match backend.connect().await {
                Ok(()) => SessionState::Playing,
                Err(err) => {
                    error!("session {} abandoned: {}", generation, err);
                    return SessionEnd::ConnectFailed(err);
                }
            },
            SessionState::Playing => match backend.begin_playback().await {
                Ok(()) => {
                    while backend.is_playing().await {
                        if latest.load(Ordering::SeqCst) != generation {
                            info!("session {} superseded, exiting", generation);
                            return SessionEnd::Superseded;
                        }
                        sleep(timing.play_poll).await;
                    }
                    sleep(timing.replay_delay).await;
                    SessionState::Playing
                }
                Err(err) => {
                    warn!("session {} playback failed: {}", generation, err);
                    SessionState::RecoveringFromError
                }
            },
            SessionState::RecoveringFromError => {
                sleep(timing.recover_delay).await;
                if backend.is_connected().await {
                    SessionState::Playing
                } else {
                    SessionState::Connecting
                }
            }
        };
    }
}

//==================================================================================================
//      Supervisor
//--------------------------------------------------------------------------------------------------

/// Sole entry point for reconnects. Every trigger (startup, health check,
/// forced disconnect) lands on the same channel; each request bumps the
/// generation and starts a session task that older tasks yield to.
#[derive(Clone)]
pub struct SessionSupervisor {
    requests: mpsc::UnboundedSender<ReconnectReason>,
}

impl SessionSupervisor {
    pub fn spawn<B: VoiceBackend + 'static>(backend: Arc<B>, timing: RetryTiming) -> Self {
        let (requests, mut queue) = mpsc::unbounded_channel();
        let latest = Arc::new(AtomicU64::new(0));
        tokio::spawn(async move {
            let mut generation = 0u64;
            while let Some(reason) = queue.recv().await {
                generation += 1;
                latest.store(generation, Ordering::SeqCst);
                info!("starting stream session {} ({:?})", generation, reason);
                tokio::spawn(run_session(
                    Arc::clone(&backend),
                    generation,
                    Arc::clone(&latest),
                    timing,
                ));
            }
        });
        SessionSupervisor { requests }
    }

    pub fn request_reconnect(&self, reason: ReconnectReason) {
        if self.requests.send(reason).is_err() {
            warn!("session supervisor is gone, dropping {:?}", reason);
        }
    }

    /// Enqueues a reconnect after a grace period, without blocking the
    /// caller.
    pub fn request_reconnect_after(&self, delay: Duration, reason: ReconnectReason) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            supervisor.request_reconnect(reason);
        });
    }
}

pub async fn run_health_check_loop<B: VoiceBackend>(
    backend: Arc<B>,
    supervisor: SessionSupervisor,
    interval: Duration,
) {
    loop {
        sleep(interval).await;
        if !backend.is_connected().await {
            warn!("voice connection lost, requesting reconnect");
            supervisor.request_reconnect(ReconnectReason::HealthCheck);
        }
    }
}

// -------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// A poll count that never runs out.
    const ENDLESS: usize = usize::MAX;

    /// Scripted stand-in for the songbird layer. Plans are consumed front
    /// to back; an empty plan means "succeed".
    #[derive(Default)]
    struct FakeBackend {
        connect_plan: Mutex<VecDeque<Result<(), SessionError>>>,
        playback_plan: Mutex<VecDeque<Result<(), SessionError>>>,
        poll_plan: Mutex<VecDeque<usize>>,
        polls_left: AtomicUsize,
        connected: AtomicBool,
        connect_attempts: AtomicUsize,
        playbacks: AtomicUsize,
        live: AtomicUsize,
    }

    impl FakeBackend {
        fn plan_connect(&self, results: impl IntoIterator<Item = Result<(), SessionError>>) {
            self.connect_plan.lock().extend(results);
        }

        fn plan_playback(&self, results: impl IntoIterator<Item = Result<(), SessionError>>) {
            self.playback_plan.lock().extend(results);
        }

        fn plan_polls(&self, counts: impl IntoIterator<Item = usize>) {
            self.poll_plan.lock().extend(counts);
        }

        fn drop_connection(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn connect_attempts(&self) -> usize {
            self.connect_attempts.load(Ordering::SeqCst)
        }

        fn playbacks(&self) -> usize {
            self.playbacks.load(Ordering::SeqCst)
        }

        fn live(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VoiceBackend for FakeBackend {
        async fn connect(&self) -> Result<(), SessionError> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            self.connect_plan.lock().pop_front().unwrap_or(Ok(()))?;
            if self.live.load(Ordering::SeqCst) > 0 {
                // tearing down the predecessor, as the real backend does
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn begin_playback(&self) -> Result<(), SessionError> {
            self.playback_plan.lock().pop_front().unwrap_or(Ok(()))?;
            let polls = self.poll_plan.lock().pop_front().unwrap_or(0);
            self.polls_left.store(polls, Ordering::SeqCst);
            self.playbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn is_playing(&self) -> bool {
            let left = self.polls_left.load(Ordering::SeqCst);
            if left == 0 {
                return false;
            }
            if left != ENDLESS {
                self.polls_left.store(left - 1, Ordering::SeqCst);
            }
            true
        }

        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn current(generation: u64) -> Arc<AtomicU64> {
        Arc::new(AtomicU64::new(generation))
    }

    #[tokio::test(start_paused = true)]
    async fn replays_after_each_natural_stop() {
        let backend = Arc::new(FakeBackend::default());
        let session = tokio::spawn(run_session(
            Arc::clone(&backend),
            1,
            current(1),
            RetryTiming::default(),
        ));

        tokio::time::sleep(Duration::from_secs(20)).await;

        assert!(
            backend.playbacks() >= 10,
            "expected a restart per replay delay, got {}",
            backend.playbacks()
        );
        assert!(!session.is_finished(), "session must never terminate on stream end");
        session.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_recovers_after_the_longer_delay() {
        let backend = Arc::new(FakeBackend::default());
        backend.plan_playback([Err(SessionError::NotConnected)]);
        let session = tokio::spawn(run_session(
            Arc::clone(&backend),
            1,
            current(1),
            RetryTiming::default(),
        ));

        // Let the session connect, fail its first playback and enter
        // recovery, then kill the connection under it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.connect_attempts(), 1);
        backend.drop_connection();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(
            backend.connect_attempts(),
            1,
            "must hold the full recover delay before touching the connection"
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.connect_attempts(), 2, "dead connection must be re-established");
        assert!(backend.playbacks() >= 1, "playback must resume after recovery");
        assert!(!session.is_finished(), "stream errors must never end the session");
        session.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_failure_ends_the_attempt_without_playback() {
        let backend = Arc::new(FakeBackend::default());
        backend.plan_connect([Err(SessionError::GuildNotFound(GuildId(1)))]);

        let end = run_session(Arc::clone(&backend), 1, current(1), RetryTiming::default()).await;

        assert!(matches!(
            end,
            SessionEnd::ConnectFailed(SessionError::GuildNotFound(_))
        ));
        assert_eq!(backend.connect_attempts(), 1, "no retry inside the attempt");
        assert_eq!(backend.playbacks(), 0, "no playback loop without a connection");
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_session_exits_at_next_checkpoint() {
        let backend = Arc::new(FakeBackend::default());
        backend.plan_polls([ENDLESS]);
        let latest = current(1);
        let session = tokio::spawn(run_session(
            Arc::clone(&backend),
            1,
            Arc::clone(&latest),
            RetryTiming::default(),
        ));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!session.is_finished());

        latest.store(2, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let end = session.await.expect("session task must not panic");
        assert!(matches!(end, SessionEnd::Superseded));
    }

    // Flags the known soft spot: two triggers in quick succession briefly
    // overlap two session tasks, but the teardown-first connect step keeps
    // a single live transport and the older generation exits on its own.
    #[tokio::test(start_paused = true)]
    async fn supervisor_keeps_one_live_connection() {
        let backend = Arc::new(FakeBackend::default());
        backend.plan_polls([ENDLESS, ENDLESS]);
        let supervisor = SessionSupervisor::spawn(Arc::clone(&backend), RetryTiming::default());

        supervisor.request_reconnect(ReconnectReason::Startup);
        supervisor.request_reconnect(ReconnectReason::HealthCheck);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(backend.live(), 1, "never more than one live connection");
        assert!(backend.connect_attempts() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_disconnect_rejoin_waits_the_grace_period() {
        let backend = Arc::new(FakeBackend::default());
        let supervisor = SessionSupervisor::spawn(Arc::clone(&backend), RetryTiming::default());

        supervisor.request_reconnect_after(REJOIN_DELAY, ReconnectReason::ForcedDisconnect);

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(backend.connect_attempts(), 0, "no rejoin before the grace period elapses");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            backend.connect_attempts() >= 1,
            "rejoin must follow within the grace period"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_restarts_a_dead_connection() {
        let backend = Arc::new(FakeBackend::default());
        let supervisor = SessionSupervisor::spawn(Arc::clone(&backend), RetryTiming::default());
        tokio::spawn(run_health_check_loop(
            Arc::clone(&backend),
            supervisor.clone(),
            HEALTH_CHECK_INTERVAL,
        ));

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(backend.connect_attempts(), 0, "no probe before the interval elapses");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(
            backend.connect_attempts() >= 1,
            "dead connection must trigger a fresh session"
        );
    }
}
