use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tributary_core::queue::delay::JobEmitter;
use tributary_core::worker::message::IntegrationJob;
use tributary_core::{IntegrationId, TenantId, Worker, WorkerMessage};
use tributary_worker::cli::{Cli, Commands};
use tributary_worker::signal::cancel_on_signal;
use tributary_worker::wiring::{build_collaborators, build_dispatcher, build_queue, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tributary_core::o11y::init_global_from_env()?;
    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    let command = match cli.command {
        Some(command) => command,
        None => Commands::default_run()?,
    };

    match command {
        Commands::Run { dev } => {
            let queue = build_queue(&settings.worker).await?;
            let (store, sink) = build_collaborators(&settings, dev)?;
            let dispatcher = build_dispatcher(&settings, queue.clone(), store, sink)?;
            let worker = Worker::new(settings.worker.clone(), queue, Arc::new(dispatcher))?;

            let cancel = CancellationToken::new();
            let signals = cancel_on_signal(cancel.clone());
            worker.run(cancel).await?;
            signals.abort();
        }
        Commands::Enqueue {
            tenant_id,
            integration_id,
            onboarding,
            delay_seconds,
        } => {
            let queue = build_queue(&settings.worker).await?;
            let emitter = JobEmitter::new(queue, settings.worker.max_delay_per_cycle_seconds);
            let tenant_id = TenantId(tenant_id);
            let message = WorkerMessage::Integration(IntegrationJob {
                tenant_id,
                integration_id: IntegrationId(integration_id),
                onboarding,
                resume: None,
            });
            let message_id = emitter.send(tenant_id, &message, delay_seconds).await?;
            tracing::info!(%message_id, %tenant_id, %integration_id, delay_seconds, "job enqueued");
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&settings.redacted()?)?);
        }
    }

    Ok(())
}
