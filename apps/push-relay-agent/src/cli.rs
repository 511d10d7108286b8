use clap::Parser;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "push-relay-agent")]
#[command(about = "Runs one push relay participant until interrupted")]
pub struct Cli {
    /// Push server base URL (overrides PUSH_RELAY_SERVER_URL)
    #[arg(long, env = "PUSH_RELAY_SERVER_URL")]
    pub server_url: Option<Url>,

    /// Redis URL backing the shared slots; without it slots live in this process only
    #[arg(long, env = "PUSH_RELAY_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Redis pub/sub channel carrying slot changes
    #[arg(long, env = "PUSH_RELAY_REDIS_CHANNEL", default_value = "push-relay:changes")]
    pub redis_channel: String,

    /// Push id to subscribe to (repeatable)
    #[arg(long = "push-id", required = true)]
    pub push_ids: Vec<String>,

    /// Keep the connection private to this participant instead of sharing it
    #[arg(long)]
    pub local: bool,

    #[arg(long, env = "PUSH_RELAY_REALM", default_value = "default")]
    pub realm: String,

    #[arg(long, env = "PUSH_RELAY_ACCOUNT")]
    pub account: String,

    #[arg(long, env = "PUSH_RELAY_TOKEN")]
    pub token: Option<String>,
}
