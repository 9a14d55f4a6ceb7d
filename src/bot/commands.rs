use std::time::Duration;

use serenity::builder::CreateApplicationCommand;
use serenity::client::bridge::gateway::ShardId;
use serenity::client::Context;
use serenity::model::application::interaction::application_command::ApplicationCommandInteraction;
use serenity::model::application::interaction::InteractionResponseType;
use serenity::model::id::GuildId;
use serenity::model::Timestamp;
use serenity::utils::Colour;
use tracing::info;

use super::state::BotState;

//==================================================================================================
//      Commands
//--------------------------------------------------------------------------------------------------

pub async fn register(ctx: &Context, guild_id: GuildId) -> serenity::Result<()> {
    let commands = guild_id
        .set_application_commands(&ctx.http, |commands| {
            commands.create_application_command(register_ping)
        })
        .await?;
    info!("registered {} slash commands", commands.len());
    Ok(())
}

fn register_ping(command: &mut CreateApplicationCommand) -> &mut CreateApplicationCommand {
    command
        .name("ping")
        .description("Check the bot's latency and stream status")
}

pub async fn handle_ping(
    ctx: &Context,
    command: &ApplicationCommandInteraction,
    state: &BotState,
) -> serenity::Result<()> {
    let latency_ms = shard_latency(ctx, state)
        .await
        .map_or(0, |latency| latency.as_millis() as u64);
    let quality = classify_latency(latency_ms);
    let uptime = state.uptime_string();
    let stream = if state.connection_live().await {
        "connected"
    } else {
        "disconnected"
    };

    command
        .create_interaction_response(&ctx.http, |response| {
            response
                .kind(InteractionResponseType::ChannelMessageWithSource)
                .interaction_response_data(|message| {
                    message.embed(|embed| {
                        embed
                            .title("Pong!")
                            .description(format!(
                                "Latency: **{latency_ms}ms**\nConnection quality: {quality}"
                            ))
                            .field(
                                "Details",
                                format!("Online for: **{uptime}**\nRadio stream: **{stream}**"),
                                false,
                            )
                            .colour(Colour::BLUE)
                            .timestamp(Timestamp::now())
                            .footer(|footer| {
                                footer.text(format!("Requested by {}", command.user.name))
                            })
                    })
                })
        })
        .await
}

// The shard runner has no estimate until its first heartbeat is acked.
async fn shard_latency(ctx: &Context, state: &BotState) -> Option<Duration> {
    let manager = state.shard_manager()?;
    let manager = manager.lock().await;
    let runners = manager.runners.lock().await;
    runners
        .get(&ShardId(ctx.shard_id))
        .and_then(|runner| runner.latency)
}

fn classify_latency(ms: u64) -> &'static str {
    if ms < 100 {
        "excellent"
    } else if ms < 200 {
        "good"
    } else {
        "slow"
    }
}
