use clap::Parser;

use proxyx_command_lib::config::{Config, ConfigError, FileConfig};

#[derive(Parser, PartialEq, Eq, Clone, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// path of the TOML configuration file
    #[arg(short = 'c', long = "config")]
    pub config: Option<String>,
    /// address to listen on
    #[arg(short = 's', long = "listen-address")]
    pub listen_address: Option<String>,
    /// port to listen on
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
    /// idle timeout of a session in seconds, 0 disables it
    #[arg(short = 't', long = "timeout")]
    pub timeout: Option<u64>,
    /// log everything
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
    /// use TCP fast open when the platform supports it
    #[arg(long = "fast-open")]
    pub fast_open: bool,
}

impl Args {
    /// the configuration file, if any, with the command line on top
    pub fn to_config(&self) -> Result<Config, ConfigError> {
        let file_config = match &self.config {
            Some(path) => FileConfig::load_from_path(path)?,
            None => FileConfig::default(),
        };
        let mut config = file_config.into_config()?;

        if let Some(listen_address) = &self.listen_address {
            config.listen_address = listen_address.clone();
        }
        if let Some(port) = self.port {
            config.listen_port = port;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        config.verbose |= self.verbose;
        config.fast_open |= self.fast_open;

        Ok(config)
    }
}
