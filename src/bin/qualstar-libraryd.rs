use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, format_err, Error};

use qualstar_library::config::{self, ServiceConfig};
use qualstar_library::server::rest;
use qualstar_library::tape::Library;
use qualstar_library::tools::command::AbortFlag;

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {}", err);
        std::process::exit(-1);
    }
}

fn run() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = parse_args()?;
    let config = config::load(&config_path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| format_err!("unable to start the runtime - {}", err))?;

    runtime.block_on(run_service(config))
}

fn parse_args() -> Result<PathBuf, Error> {
    let mut config_path = PathBuf::from(config::DEFAULT_CONFIG_PATH);

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => match args.next() {
                Some(path) => config_path = PathBuf::from(path),
                None => bail!("--config requires a path"),
            },
            "--help" | "-h" => {
                println!("usage: qualstar-libraryd [--config <path>]");
                std::process::exit(0);
            }
            other => bail!("unknown argument '{}'", other),
        }
    }

    Ok(config_path)
}

async fn run_service(config: ServiceConfig) -> Result<(), Error> {
    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .map_err(|err| format_err!("invalid bind address '{}' - {}", config.bind_address(), err))?;

    let library = Library::with_defaults(config.tape_library.clone());

    // eager initialization; failures are retried through /library/verify
    if let Err(err) = library.initialize(&AbortFlag::new()).await {
        log::warn!("library initialization failed - {}", err);
    }

    rest::serve(Arc::clone(&library), addr, shutdown_signal()).await?;

    // unmount and eject everything before going down
    log::info!("shutting down - releasing all drives");
    release_all(&library).await;

    Ok(())
}

async fn release_all(library: &Arc<Library>) {
    let mut operation = library.release().await;
    let trace_id = operation.trace_id.to_string();

    while !operation.is_finished() {
        tokio::time::sleep(Duration::from_millis(500)).await;
        operation = match library.operation(&trace_id, None) {
            Some(operation) => operation,
            None => break,
        };
    }

    log::info!(
        "release finished: {}{}",
        operation.status,
        operation
            .message
            .as_deref()
            .map(|message| format!(" - {}", message))
            .unwrap_or_default()
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("unable to listen for the interrupt signal - {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                log::error!("unable to listen for SIGTERM - {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
