use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use serenity::async_trait;
use serenity::client::{Client, ClientBuilder, Context, EventHandler};
use serenity::model::application::interaction::Interaction;
use serenity::model::gateway::Ready;
use serenity::model::id::{ChannelId, UserId};
use serenity::model::prelude::VoiceState;
use serenity::prelude::GatewayIntents;
use songbird::SerenityInit;
use tracing::{error, info, warn};

use crate::config::Config;

mod commands;
mod presence;
mod session;
mod state;
mod voice;

use session::{ReconnectReason, RetryTiming, SessionSupervisor, HEALTH_CHECK_INTERVAL, REJOIN_DELAY};
use state::{BotState, DEFAULT_VOLUME};
use voice::SongbirdBackend;

//==================================================================================================
//      Handler
//--------------------------------------------------------------------------------------------------
struct Handler {
    config: Arc<Config>,
    state: Arc<BotState>,
    supervisor: OnceLock<SessionSupervisor>,
    loops_started: AtomicBool,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected", ready.user.name);
        self.state.mark_ready();

        if let Err(err) = commands::register(&ctx, self.config.guild_id).await {
            error!("failed to register slash commands: {}", err);
        }

        // The gateway re-delivers `ready` after a resume; the background
        // loops must only ever be spawned once.
        if self.loops_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager = songbird::get(&ctx)
            .await
            .expect("songbird registered at client init");
        let backend = Arc::new(SongbirdBackend::new(
            manager,
            ctx.cache.clone(),
            ctx.http.clone(),
            Arc::clone(&self.state),
            &self.config,
        ));

        let supervisor = SessionSupervisor::spawn(Arc::clone(&backend), RetryTiming::default());
        supervisor.request_reconnect(ReconnectReason::Startup);
        let _ = self.supervisor.set(supervisor.clone());

        tokio::spawn(presence::run_presence_loop(
            ctx,
            Arc::clone(&self.state),
            self.config.guild_id,
        ));
        tokio::spawn(session::run_health_check_loop(
            backend,
            supervisor,
            HEALTH_CHECK_INTERVAL,
        ));

        info!("radio tasks started");
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let bot_id = ctx.cache.current_user().id;
        let before = old.and_then(|state| state.channel_id);
        if !is_forced_disconnect(bot_id, new.user_id, before, new.channel_id) {
            return;
        }
        if self.state.consume_expected_disconnect() {
            // our own teardown echoing back through the gateway
            return;
        }
        warn!("removed from voice channel, rejoining in {:?}", REJOIN_DELAY);
        if let Some(supervisor) = self.supervisor.get() {
            supervisor.request_reconnect_after(REJOIN_DELAY, ReconnectReason::ForcedDisconnect);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::ApplicationCommand(command) = interaction {
            if command.data.name == "ping" {
                if let Err(err) = commands::handle_ping(&ctx, &command, &self.state).await {
                    error!("failed to respond to ping: {}", err);
                }
            }
        }
    }
}

/// True when the bot itself went from some voice channel to none, i.e. it
/// was removed rather than moved.
fn is_forced_disconnect(
    bot_id: UserId,
    member_id: UserId,
    before: Option<ChannelId>,
    after: Option<ChannelId>,
) -> bool {
    member_id == bot_id && before.is_some() && after.is_none()
}

//==================================================================================================
//      Bot
//--------------------------------------------------------------------------------------------------
pub struct Bot {
    client: Client,
}

impl Bot {
    pub async fn new(config: Config, intents: GatewayIntents) -> Result<Self, serenity::Error> {
        let config = Arc::new(config);
        let state = Arc::new(BotState::new(DEFAULT_VOLUME));

        let handler = Handler {
            config: Arc::clone(&config),
            state: Arc::clone(&state),
            supervisor: OnceLock::new(),
            loops_started: AtomicBool::new(false),
        };

        let client = ClientBuilder::new(&config.token, intents)
            .event_handler(handler)
            .register_songbird()
            .await?;

        state.set_shard_manager(client.shard_manager.clone());

        Ok(Bot { client })
    }

    pub async fn start(&mut self) -> Result<(), serenity::Error> {
        self.client.start().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_bot_leaving_counts_as_forced_disconnect() {
        let bot = UserId(10);
        let someone = UserId(11);
        let channel = Some(ChannelId(7));

        assert!(is_forced_disconnect(bot, bot, channel, None));
        // someone else leaving
        assert!(!is_forced_disconnect(bot, someone, channel, None));
        // the bot joining
        assert!(!is_forced_disconnect(bot, bot, None, channel));
        // the bot moving between channels
        assert!(!is_forced_disconnect(bot, bot, channel, Some(ChannelId(8))));
    }
}
