use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use chat_router::{
    api,
    config::Config,
    dispatcher::RouterContext,
    events::{init_logging, EventEmitter, RouterEvent},
    mailbox::LocalMailbox,
    registry::{AgentRegistry, HttpAgentRegistry, LocalRegistry},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg)?;

    let registry: Arc<dyn AgentRegistry> = match cfg.lifecycle_url.as_deref() {
        Some(url) => {
            tracing::info!(lifecycle_url = %url, "using lifecycle service registry");
            Arc::new(
                HttpAgentRegistry::with_timeout(url, cfg.registry_timeout())
                    .context("failed to build lifecycle service client")?,
            )
        }
        None => {
            let agents = cfg.agents_vec();
            tracing::info!(agents = ?agents, "using in-memory registry");
            Arc::new(LocalRegistry::with_running(agents))
        }
    };

    let mailbox = LocalMailbox::default();
    let events = EventEmitter::new(cfg.json_events);
    let ctx = RouterContext::new(
        registry,
        Arc::new(mailbox.clone()),
        cfg.router_settings(),
        events.clone(),
    );

    let addr = format!("{}:{}", cfg.bind, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind router on {addr}"))?;
    tracing::info!(addr = %addr, primary = %ctx.primary(), "chat router listening");
    events.emit(RouterEvent::RouterStarted {
        addr: addr.clone(),
        primary: ctx.primary().clone(),
    });

    axum::serve(listener, api::router(ctx, mailbox))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("router server error")?;

    events.emit(RouterEvent::RouterStopped {});
    Ok(())
}
