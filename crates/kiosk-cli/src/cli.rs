//! Command-line flags.  Every flag is optional and, when given, wins over the
//! config file and the environment.

use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;

#[derive(Debug, Default, Parser)]
#[command(
    name = "parcel-bridge",
    version,
    about = "MQTT <-> locker controller: box_delivered -> 'o'; 'done' -> all_done='success'"
)]
pub struct Cli {
    /// Config file (defaults to ~/.parcel-bridge/config.toml when present).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Write the effective configuration to the config path and exit.
    #[arg(long)]
    pub save_config: bool,

    /// MQTT broker host.
    #[arg(long)]
    pub host: Option<String>,

    /// MQTT broker port.
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub client_id: Option<String>,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    /// Serial device, e.g. /dev/ttyUSB0.
    #[arg(long)]
    pub serial_port: Option<String>,

    #[arg(long)]
    pub baud: Option<u32>,

    /// Topic that arms the bridge.
    #[arg(long)]
    pub ready_topic: Option<String>,

    /// Topic the completion message is published to.
    #[arg(long)]
    pub completion_topic: Option<String>,

    /// Log at debug level regardless of RUST_LOG.
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Overlay the flags that were given onto `cfg`.
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(v) = &self.host {
            cfg.mqtt.host = v.clone();
        }
        if let Some(v) = self.port {
            cfg.mqtt.port = v;
        }
        if let Some(v) = &self.client_id {
            cfg.mqtt.client_id = v.clone();
        }
        if let Some(v) = &self.username {
            cfg.mqtt.username = Some(v.clone());
        }
        if let Some(v) = &self.password {
            cfg.mqtt.password = Some(v.clone());
        }
        if let Some(v) = &self.serial_port {
            cfg.serial.port = v.clone();
        }
        if let Some(v) = self.baud {
            cfg.serial.baud = v;
        }
        if let Some(v) = &self.ready_topic {
            cfg.bridge.ready_topic = v.clone();
        }
        if let Some(v) = &self.completion_topic {
            cfg.bridge.completion_topic = v.clone();
        }
    }
}
