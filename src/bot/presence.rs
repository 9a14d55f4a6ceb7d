use std::sync::Arc;
use std::time::Duration;

use serenity::client::Context;
use serenity::model::gateway::Activity;
use serenity::model::guild::Guild;
use serenity::model::id::GuildId;
use tokio::time::sleep;
use tracing::debug;

use super::state::BotState;

/// How often the displayed status advances.
const ROTATION_INTERVAL: Duration = Duration::from_secs(30);

pub struct GuildStats {
    pub members: u64,
    pub humans: u64,
    pub bots: u64,
}

impl GuildStats {
    fn from_counts(members: u64, bots: u64) -> Self {
        GuildStats {
            members,
            humans: members.saturating_sub(bots),
            bots,
        }
    }

    fn collect(guild: &Guild) -> Self {
        let bots = guild
            .members
            .values()
            .filter(|member| member.user.bot)
            .count() as u64;
        GuildStats::from_counts(guild.member_count, bots)
    }
}

fn status_lines(stats: &GuildStats, uptime: &str) -> [String; 5] {
    [
        "radio live".to_string(),
        format!("members: {}", stats.members),
        format!("humans: {}", stats.humans),
        format!("bots: {}", stats.bots),
        format!("uptime: {uptime}"),
    ]
}

/// Publishes one status per tick, recomputing the member statistics each
/// time. Ticks with the guild missing from cache are skipped silently.
pub async fn run_presence_loop(ctx: Context, state: Arc<BotState>, guild_id: GuildId) {
    loop {
        match ctx.cache.guild(guild_id) {
            Some(guild) => {
                let stats = GuildStats::collect(&guild);
                let lines = status_lines(&stats, &state.uptime_string());
                let line = &lines[state.next_status(lines.len())];
                ctx.set_activity(Activity::listening(line.as_str())).await;
            }
            None => debug!("guild {} not cached, skipping status tick", guild_id),
        }
        sleep(ROTATION_INTERVAL).await;
    }
}
