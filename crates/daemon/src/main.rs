// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! wardend: the warden supervisor daemon.

use std::path::PathBuf;
use warden_daemon::{env, lifecycle};

fn print_usage() {
    eprintln!(
        "wardend {}\n\nUSAGE:\n    wardend [--state-dir PATH]\n\nENVIRONMENT:\n    WARDEN_STATE_DIR    state directory (default ~/.local/state/warden)\n    WARDEN_LOG          tracing filter (default info)",
        env::PROTOCOL_VERSION
    );
}

fn parse_args() -> Result<Option<PathBuf>, i32> {
    let mut args = std::env::args().skip(1);
    let mut state_dir = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--state-dir" => match args.next() {
                Some(path) => state_dir = Some(PathBuf::from(path)),
                None => {
                    eprintln!("--state-dir requires a path");
                    return Err(2);
                }
            },
            "--version" | "-V" => {
                println!("wardend {}", env::PROTOCOL_VERSION);
                return Err(0);
            }
            "--help" | "-h" => {
                print_usage();
                return Err(0);
            }
            other => {
                eprintln!("unknown argument: {other}");
                print_usage();
                return Err(2);
            }
        }
    }
    Ok(state_dir)
}

fn init_tracing(state_dir: &std::path::Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_env("WARDEN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match std::fs::create_dir_all(state_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(state_dir, "wardend.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
            None
        }
    }
}

fn main() -> std::process::ExitCode {
    let state_dir = match parse_args() {
        Ok(dir) => dir,
        Err(code) => return std::process::ExitCode::from(code as u8),
    };
    let state_dir = match state_dir.map(Ok).unwrap_or_else(env::state_dir) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("wardend: {e}");
            return std::process::ExitCode::from(1);
        }
    };

    let _log_guard = init_tracing(&state_dir);
    let paths = lifecycle::Paths::under(&state_dir);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to build runtime");
            return std::process::ExitCode::from(1);
        }
    };

    let result: Result<(), lifecycle::LifecycleError> = runtime.block_on(async {
        let daemon = lifecycle::startup(&paths).await?;
        let shutdown = daemon.shutdown_token();

        // SIGTERM / SIGINT both request a clean shutdown.
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::error!(error = %e, "signal handler installation failed");
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("SIGTERM received"),
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "ctrl-c handler failed");
                    } else {
                        tracing::info!("SIGINT received");
                    }
                }
            }
            shutdown.cancel();
        });

        daemon.run().await;
        Ok(())
    });

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            eprintln!("wardend: {e}");
            std::process::ExitCode::from(1)
        }
    }
}
