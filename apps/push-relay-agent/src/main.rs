mod cli;
mod telemetry;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use push_relay::{HttpTransport, PushRelay, RelayConfig, RelayContext, RelayEvent, StaticAuth};
use shared_slot::{LocalSlots, MemoryOrigin, RedisSlots, SlotBackend, SlotStore};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cli::Cli;
use crate::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = RelayConfig::from_env().context("reading relay configuration")?;
    if let Some(server_url) = cli.server_url.clone() {
        config.server_url = server_url;
    }
    if cli.local {
        config.share_connection = false;
    }
    init_tracing(&config.log_filter);

    let shared: Arc<dyn SlotBackend> = match &cli.redis_url {
        Some(url) => Arc::new(
            RedisSlots::connect(url, cli.redis_channel.clone())
                .await
                .with_context(|| format!("connecting to redis at {url}"))?,
        ),
        None => Arc::new(MemoryOrigin::new().attach()),
    };
    let store = SlotStore::new(
        config.key_prefix.clone(),
        Arc::new(LocalSlots::new()),
        shared,
        config.share_connection,
    );

    let mut auth = StaticAuth::new(cli.realm.clone(), cli.account.clone());
    if let Some(token) = cli.token.clone() {
        auth = auth.with_token(token);
    }

    info!(
        server_url = %config.server_url,
        redis = cli.redis_url.is_some(),
        share_connection = config.share_connection,
        poll_period_ms = config.poll_period.as_millis() as u64,
        push_ids = ?cli.push_ids,
        "starting push relay agent"
    );

    let ctx = RelayContext::new(config, store, Arc::new(HttpTransport::new()), Arc::new(auth));
    let relay = PushRelay::start(ctx);
    relay
        .register(cli.push_ids.clone(), |notification| {
            info!(
                push_ids = ?notification.push_ids,
                payload = notification.payload.as_deref().unwrap_or(""),
                "notification"
            );
        })
        .await
        .context("registering push ids")?;

    let mut events = relay.events();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("waiting for ctrl-c")?;
                break;
            }
            event = events.recv() => match event {
                Ok(RelayEvent::Received { .. }) => {}
                Ok(event) => info!(?event, "relay event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event listener lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!(participant = %relay.participant_id(), "shutting down");
    relay.shutdown().await.context("shutting down relay")?;
    Ok(())
}
