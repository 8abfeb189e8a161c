//! Server configuration.

use std::path::PathBuf;

use clap::Parser;

/// Command-line / environment configuration for the vouch daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "vouch-server", about = "Local web-of-trust message store")]
pub struct ServerConfig {
    /// Storage root for the database and peers file.
    #[arg(long, env = "VOUCH_DATADIR", default_value = ".vouch")]
    pub datadir: PathBuf,

    /// Database size budget in megabytes.
    #[arg(long, env = "VOUCH_DB_MAX_SIZE", default_value_t = 100)]
    pub db_max_size: u64,

    /// Closure depth for queued trust-map regeneration.
    #[arg(long, env = "VOUCH_TRUST_MAP_DEPTH", default_value_t = 4)]
    pub generate_trust_map_depth: u32,

    /// Replacement window for repeat messages, in seconds.
    #[arg(long, env = "VOUCH_MIN_MSG_INTERVAL", default_value_t = 30 * 24 * 60 * 60)]
    pub min_msg_interval: i64,

    /// Whether messages with priority 0 are stored at all.
    #[arg(long, env = "VOUCH_SAVE_UNTRUSTED", default_value_t = true, action = clap::ArgAction::Set)]
    pub save_untrusted_msgs: bool,

    /// Bind address for the JSON command surface.
    #[arg(long, env = "VOUCH_WEB_ADDR", default_value = "127.0.0.1:4944")]
    pub web_addr: String,
}

impl ServerConfig {
    pub fn store_options(&self) -> crate::store::StoreOptions {
        crate::store::StoreOptions {
            max_size_mb: self.db_max_size,
            trust_map_depth: self.generate_trust_map_depth,
            min_msg_interval: self.min_msg_interval,
            save_untrusted: self.save_untrusted_msgs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::parse_from(["vouch-server"]);
        assert_eq!(config.db_max_size, 100);
        assert_eq!(config.generate_trust_map_depth, 4);
        assert_eq!(config.min_msg_interval, 30 * 24 * 60 * 60);
        assert!(config.save_untrusted_msgs);
    }

    #[test]
    fn overrides() {
        let config = ServerConfig::parse_from([
            "vouch-server",
            "--db-max-size",
            "1",
            "--save-untrusted-msgs",
            "false",
            "--generate-trust-map-depth",
            "2",
        ]);
        assert_eq!(config.db_max_size, 1);
        assert!(!config.save_untrusted_msgs);
        let opts = config.store_options();
        assert_eq!(opts.max_size_mb, 1);
        assert_eq!(opts.trust_map_depth, 2);
        assert!(!opts.save_untrusted);
    }
}
