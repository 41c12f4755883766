use clap::Parser;
use tokio::signal;
use tradegate_server::{
    DrainEscalation, DrainPolicy, EchoController, ServerCredentials, ServiceServer,
    server::{
        config::{CliArgs, ServerConfig},
        telemetry::{TelemetryProviders, init_telemetry},
    },
};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    // Signal handling and telemetry export run here. Requests are served by
    // the server's own worker pool.
    let control = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("tradegate-control")
        .enable_all()
        .build()?;
    let providers = {
        let _enter = control.enter();
        init_telemetry()?
    };

    let mut server = build_server(&config)?;
    log_startup_info(&server, &config);
    server.start()?;

    control.block_on(shutdown_signal())?;
    tracing::info!("Shutdown signal received, terminating gracefully...");

    if let Err(e) = server.shutdown(Some(config.shutdown_grace)) {
        tracing::error!("Error during service shutdown: {e}");
    }
    tracing::info!("Service shut down successfully");

    flush_telemetry(providers);
    Ok(())
}

fn build_server(config: &ServerConfig) -> anyhow::Result<ServiceServer> {
    let mut builder = ServiceServer::builder(EchoController::new());
    if let Some(host) = &config.host {
        builder = builder.host(host.clone());
    }
    if let Some(port) = config.port {
        builder = builder.port(port);
    }
    if let Some(max_workers) = config.max_workers {
        builder = builder.max_workers(max_workers);
    }
    if let Some(tls) = &config.tls {
        builder = builder.credentials(ServerCredentials::from_files(
            &tls.cert,
            &tls.key,
            tls.client_ca.as_deref(),
        )?);
    }
    if let Some(timeout) = config.drain_timeout {
        builder = builder.drain_policy(DrainPolicy::Bounded {
            timeout,
            on_timeout: DrainEscalation::Abandon,
        });
    }
    Ok(builder.build()?)
}

fn log_startup_info(server: &ServiceServer, config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting controller service on {} with full config: {:#?}",
            server.address(),
            config
        );
    } else {
        tracing::info!(
            "Starting controller service on {} with {} workers",
            server.address(),
            server.max_workers()
        );
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminate = async move {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
    Ok(())
}

#[allow(unused_variables)]
fn flush_telemetry(providers: TelemetryProviders) {
    #[cfg(feature = "tracing")]
    {
        if let Err(err) = providers.tracer_provider.force_flush() {
            eprintln!("Error flushing traces: {:#?}", err);
        }
        if let Err(err) = providers.tracer_provider.shutdown() {
            eprintln!("Error shutting down tracer: {:#?}", err);
        }
    }

    #[cfg(feature = "metrics")]
    {
        if let Err(err) = providers.meter_provider.force_flush() {
            eprintln!("Error flushing metrics: {:#?}", err);
        }
        if let Err(err) = providers.meter_provider.shutdown() {
            eprintln!("Error shutting down meter: {:#?}", err);
        }
    }
}
