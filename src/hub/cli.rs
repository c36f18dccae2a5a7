// CLI commands for the control center

use crate::hub::config::ClientConfig;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Control center CLI
#[derive(Debug, Parser)]
#[command(name = "bci-hub")]
#[command(about = "Message broker and clock reference for BCI lab rigs")]
pub struct HubCli {
    #[command(subcommand)]
    pub command: HubCommand,
}

/// Where a client connects and who it says it is
#[derive(Debug, Clone, Args)]
pub struct ConnectArgs {
    /// Control center host
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Control center port
    #[arg(long, default_value = "12345")]
    pub port: u16,

    /// Shared secret (exactly 8 bytes)
    #[arg(long, default_value = "12345678")]
    pub key: String,

    /// Service path of this client
    #[arg(long)]
    pub path: String,

    /// Instance uid of this client
    #[arg(long)]
    pub uid: String,

    /// Seconds between keep-alives (0 disables them)
    #[arg(long, default_value = "5")]
    pub keep_alive: u64,

    /// Response timeout in milliseconds for letters awaiting a reply
    #[arg(long, default_value = "3000")]
    pub response_timeout_ms: u64,
}

impl ConnectArgs {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.host.clone(),
            port: self.port,
            key: self.key.clone(),
            keep_alive_secs: self.keep_alive,
            response_timeout_ms: self.response_timeout_ms,
            ..ClientConfig::new(self.path.clone(), self.uid.clone())
        }
    }
}

/// Control center subcommands
#[derive(Debug, Subcommand)]
pub enum HubCommand {
    /// Run the control center until Ctrl+C
    Serve {
        /// JSON config file; flags below override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to bind
        #[arg(short, long)]
        port: Option<u16>,

        /// Shared secret (exactly 8 bytes)
        #[arg(short, long)]
        key: Option<String>,

        /// Ask clients for their bag dumps on every keep-alive
        #[arg(long)]
        acquire_bags: bool,

        /// Log a session table every N seconds
        #[arg(long)]
        status_interval: Option<u64>,
    },

    /// Simulated workload: answer every letter after a random delay
    Worker {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Shortest simulated work time in seconds
        #[arg(long, default_value = "2.0")]
        min_secs: f64,

        /// Longest simulated work time in seconds
        #[arg(long, default_value = "5.0")]
        max_secs: f64,
    },

    /// Send one letter
    Send {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Destination address, `path?uid` (empty uid broadcasts)
        #[arg(short, long)]
        dst: String,

        /// Letter content
        #[arg(short, long)]
        content: String,

        /// Wait for the response and report how the letter ended
        #[arg(short, long)]
        wait: bool,
    },

    /// Forward every stdin line as a letter
    Forward {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Destination address, `path?uid`
        #[arg(short, long)]
        dst: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = HubCli::try_parse_from(["bci-hub", "serve", "--port", "23456", "--acquire-bags"]);
        match cli.unwrap().command {
            HubCommand::Serve {
                port, acquire_bags, ..
            } => {
                assert_eq!(port, Some(23456));
                assert!(acquire_bags);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let args = vec![
            "bci-hub",
            "send",
            "--path",
            "/client/keyboardHiker",
            "--uid",
            "keyboard-hiker-1",
            "--dst",
            "/client/simulationWorkload?",
            "--content",
            "key a",
            "--wait",
        ];
        assert!(HubCli::try_parse_from(args).is_ok());
    }

    #[test]
    fn test_worker_requires_identity() {
        assert!(HubCli::try_parse_from(["bci-hub", "worker"]).is_err());

        let cli = HubCli::try_parse_from([
            "bci-hub",
            "worker",
            "--path",
            "/client/simulationWorkload",
            "--uid",
            "sw-1",
            "--port",
            "4000",
        ])
        .unwrap();
        let HubCommand::Worker {
            connect, min_secs, ..
        } = cli.command
        else {
            panic!("expected worker");
        };
        assert_eq!(min_secs, 2.0);

        let config = connect.client_config();
        assert_eq!(config.port, 4000);
        assert_eq!(config.identity().address(), "/client/simulationWorkload?sw-1");
    }
}
