use std::sync::Arc;

use clap::{crate_description, crate_version, Parser};
use stackable_operator::logging::TracingTarget;
use stackable_webhook_tls::{
    config::WebhookTlsOpts,
    server::{AllowAll, Hook},
};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

pub const APP_NAME: &str = "webhook-tls";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(flatten)]
    webhook: WebhookTlsOpts,
    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    stackable_operator::logging::initialize_logging(
        "WEBHOOK_TLS_LOG",
        APP_NAME,
        opts.tracing_target,
    );
    stackable_operator::utils::print_startup_string(
        crate_description!(),
        crate_version!(),
        built_info::GIT_VERSION,
        built_info::TARGET.unwrap_or("unknown target"),
        built_info::BUILT_TIME_UTC,
        built_info::RUSTC_VERSION,
    );
    let config = opts.webhook.resolve()?;
    let hooks = config
        .hooks
        .iter()
        .map(|hook| Hook {
            path: hook.path.clone(),
            kind: hook.kind,
            handler: Arc::new(AllowAll),
        })
        .collect();

    let client =
        stackable_operator::client::create_client(Some("webhook-tls.stackable.tech".to_string()))
            .await?;

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
            }
            shutdown.cancel();
        }
    });

    stackable_webhook_tls::run(client.as_kube_client(), config, hooks, shutdown).await?;
    Ok(())
}
