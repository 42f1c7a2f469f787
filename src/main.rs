//! audio-link binary: option parsing, logging and signal wiring
//! around the session orchestrator.

use std::process;

use clap::Parser;

use audio_link::{AudioLink, Config, ControlHandle, LoopbackBackend, UdpEngine};

fn main() {
    let config = Config::parse();
    let role = match config.role() {
        Ok(role) => role,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Orchestrator callbacks are serialized on one loop thread;
    // the engine's socket tasks cooperate on the same runtime.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("creating the runtime failed: {}", e);
            process::exit(1);
        }
    };

    let code = runtime.block_on(async {
        let engine = Box::new(UdpEngine::new());
        let backend = Box::new(LoopbackBackend::default());
        let mut link = match AudioLink::start(role, &config, engine, backend) {
            Ok(link) => link,
            Err(e) => {
                eprintln!("{}", e);
                return 1;
            }
        };

        install_signal_handlers(&link.control());
        println!("Ready.");

        let reason = link.run().await;
        link.shutdown();
        reason.code()
    });

    process::exit(code);
}

#[cfg(unix)]
fn install_signal_handlers(control: &ControlHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    for kind in [
        SignalKind::hangup(),
        SignalKind::interrupt(),
        SignalKind::terminate(),
    ] {
        match signal(kind) {
            Ok(mut stream) => {
                let control = control.clone();
                tokio::spawn(async move {
                    if stream.recv().await.is_some() {
                        println!("Audio Link exiting...");
                        control.quit();
                    }
                });
            }
            Err(e) => log::warn!("installing signal handler failed: {}", e),
        }
    }

    match signal(SignalKind::user_defined1()) {
        Ok(mut stream) => {
            let control = control.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    control.dump_stats();
                }
            });
        }
        Err(e) => log::warn!("installing SIGUSR1 handler failed: {}", e),
    }
}

#[cfg(not(unix))]
fn install_signal_handlers(control: &ControlHandle) {
    let control = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Audio Link exiting...");
            control.quit();
        }
    });
}
