use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::cache::Cache;
use serenity::http::Http;
use serenity::model::channel::ChannelType;
use serenity::model::id::{ChannelId, GuildId};
use songbird::input;
use songbird::tracks::{create_player, PlayMode, TrackHandle};
use songbird::Songbird;
use tracing::info;

use super::session::{SessionError, VoiceBackend};
use super::state::BotState;
use crate::config::Config;

// ffmpeg retries the network read transparently, with a bounded delay
// between reconnect attempts.
const STREAM_RECONNECT_ARGS: &[&str] = &[
    "-reconnect",
    "1",
    "-reconnect_streamed",
    "1",
    "-reconnect_delay_max",
    "5",
];

// The driver reads stdout as 32-bit float PCM, so the muxer must match
// the codec.
const STREAM_DECODE_ARGS: &[&str] = &[
    "-f",
    "f32le",
    "-ac",
    "2",
    "-ar",
    "48000",
    "-acodec",
    "pcm_f32le",
    "-",
];

/// Production `VoiceBackend` backed by songbird and the serenity cache.
pub struct SongbirdBackend {
    manager: Arc<Songbird>,
    cache: Arc<Cache>,
    http: Arc<Http>,
    state: Arc<BotState>,
    guild_id: GuildId,
    channel_id: ChannelId,
    stream_url: String,
    track: Mutex<Option<TrackHandle>>,
}

impl SongbirdBackend {
    pub fn new(
        manager: Arc<Songbird>,
        cache: Arc<Cache>,
        http: Arc<Http>,
        state: Arc<BotState>,
        config: &Config,
    ) -> Self {
        SongbirdBackend {
            manager,
            cache,
            http,
            state,
            guild_id: config.guild_id,
            channel_id: config.voice_channel_id,
            stream_url: config.stream_url.clone(),
            track: Mutex::new(None),
        }
    }
}

#[async_trait]
impl VoiceBackend for SongbirdBackend {
    async fn connect(&self) -> Result<(), SessionError> {
        if self.cache.guild(self.guild_id).is_none() {
            return Err(SessionError::GuildNotFound(self.guild_id));
        }
        let channels = self.guild_id.channels(&self.http).await?;
        let is_voice = channels
            .get(&self.channel_id)
            .map(|channel| channel.kind == ChannelType::Voice)
            .unwrap_or(false);
        if !is_voice {
            return Err(SessionError::ChannelNotFound(self.channel_id));
        }

        if let Some(call) = self.state.current_call() {
            let mut call = call.lock().await;
            if call.current_connection().is_some() {
                info!("tearing down stale voice connection");
                self.state.expect_disconnect();
                call.leave().await?;
            }
        }

        let (call, joined) = self.manager.join(self.guild_id, self.channel_id).await;
        joined?;
        self.state.set_call(call);
        info!("joined voice channel {}", self.channel_id);
        Ok(())
    }

    async fn begin_playback(&self) -> Result<(), SessionError> {
        let call = self.state.current_call().ok_or(SessionError::NotConnected)?;
        let source =
            input::ffmpeg_optioned(&self.stream_url, STREAM_RECONNECT_ARGS, STREAM_DECODE_ARGS)
                .await?;
        // The gain has to be on the track before it is mixed; a fresh
        // track otherwise plays its first samples at full volume.
        let (mut track, handle) = create_player(source);
        track.set_volume(self.state.volume());
        call.lock().await.play_only(track);
        info!(
            "streaming {} at volume {:.0}%",
            self.stream_url,
            self.state.volume() * 100.0
        );
        *self.track.lock() = Some(handle);
        Ok(())
    }

    async fn is_playing(&self) -> bool {
        let handle = self.track.lock().clone();
        match handle {
            Some(handle) => {
                matches!(handle.get_info().await, Ok(info) if info.playing == PlayMode::Play)
            }
            None => false,
        }
    }

    async fn is_connected(&self) -> bool {
        self.state.connection_live().await
    }
}
