//! watchsec: telemetry hub, mail interceptor and ICAP responder in one process.

use clap::Parser;
use tokio_util::sync::CancellationToken;

use watchsec_core::config::HubConfig;
use watchsec_hub::client::AdminClient;
use watchsec_hub::commands::CommandRequest;
use watchsec_hub::runtime;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let mut config = HubConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    let command = args
        .command
        .unwrap_or_else(|| cli::Command::Serve(cli::ServeOpts::default()));

    match command {
        cli::Command::Serve(opts) => {
            let filter = std::env::var("WATCHSEC_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string());
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                .init();

            opts.apply(&mut config);
            config.validate()?;
            tracing::info!("watchsec hub starting");

            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                runtime::shutdown_signal().await;
                signal_cancel.cancel();
            });
            runtime::serve(config, cancel).await?;
            tracing::info!("watchsec hub stopped");
        }
        cli::Command::Exec(opts) => {
            let mut client = AdminClient::connect(&config.admin.socket).await?;
            let result = client
                .execute_command(&CommandRequest {
                    agent_id: opts.agent_id,
                    command: opts.command,
                    target: opts.target,
                    actor: opts.actor,
                    tenant_id: opts.tenant,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        cli::Command::Status => {
            let mut client = AdminClient::connect(&config.admin.socket).await?;
            let snapshot = client.list_connections().await?;
            println!("dashboards: {}", snapshot.dashboards);
            println!("agents:     {}", snapshot.agents);
            for (agent_id, members) in &snapshot.groups {
                println!("  {agent_id}: {members}");
            }
        }
        cli::Command::SeedTenant { name, api_key } => {
            let backend = runtime::open_backend(&config)?;
            let id = backend
                .with_store(move |s| s.upsert_tenant(&name, &api_key))
                .await?;
            println!("tenant {id}");
        }
        cli::Command::SeedSession {
            token,
            username,
            tenant,
        } => {
            let backend = runtime::open_backend(&config)?;
            backend
                .with_store(move |s| s.insert_session(&token, &username, tenant))
                .await?;
            println!("session registered");
        }
    }

    Ok(())
}
