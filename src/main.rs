use serenity::prelude::GatewayIntents;
use tracing_subscriber::EnvFilter;

use crate::bot::Bot;
use crate::config::Config;

mod bot;
mod config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Config::from_env()?;

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_VOICE_STATES;

    let mut bot = Bot::new(config, intents).await?;
    bot.start().await?;

    Ok(())
}
