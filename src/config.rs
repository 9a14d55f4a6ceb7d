use std::env;
use std::num::ParseIntError;

use serenity::model::id::{ChannelId, GuildId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("{0} is not a valid numeric id: {1}")]
    InvalidId(&'static str, ParseIntError),
}

/// Everything the bot needs from the environment. All fields are required;
/// startup fails before the gateway is touched if any is absent.
#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,
    pub guild_id: GuildId,
    pub voice_channel_id: ChannelId,
    pub stream_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            token: require("DISCORD_TOKEN")?,
            guild_id: GuildId(parse_id("GUILD_ID")?),
            voice_channel_id: ChannelId(parse_id("VOICE_CHANNEL_ID")?),
            stream_url: require("RADIO_URL")?,
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_id(name: &'static str) -> Result<u64, ConfigError> {
    require(name)?
        .parse()
        .map_err(|err| ConfigError::InvalidId(name, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test so the process-wide environment is only touched from a
    // single thread.
    #[test]
    fn from_env_validates_every_variable() {
        env::remove_var("DISCORD_TOKEN");
        env::set_var("GUILD_ID", "1");
        env::set_var("VOICE_CHANNEL_ID", "2");
        env::set_var("RADIO_URL", "https://radio.example/stream");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("DISCORD_TOKEN"))
        ));

        env::set_var("DISCORD_TOKEN", "token");
        env::set_var("GUILD_ID", "not-a-number");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidId("GUILD_ID", _))
        ));

        env::set_var("GUILD_ID", "123456789");
        let config = Config::from_env().expect("all variables set");
        assert_eq!(config.guild_id, GuildId(123456789));
        assert_eq!(config.voice_channel_id, ChannelId(2));
        assert_eq!(config.stream_url, "https://radio.example/stream");
    }
}
