#[cfg(any(target_os = "android", target_os = "linux"))]
mod linux;

mod cli;
mod client;
mod config;
mod controller;
mod daemon;
mod detector;
mod histogram;
mod probe;
mod profile;
mod risk;
mod sampler;
mod server;
mod store;
mod summary;
mod timestamp;

use std::sync::{Arc, Mutex};

use config::WadesConfig;

fn main() {
    env_logger::init();

    use clap::Parser;
    let opt = cli::Opt::parse();
    let config = match WadesConfig::load(opt.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {err}");
            std::process::exit(1)
        }
    };

    match opt.action {
        cli::Action::Start => do_start_action(&config, opt.config.as_deref()),
        cli::Action::Stop => do_stop_action(&config),
        cli::Action::Run => do_run_action(&config),
        cli::Action::Modeller(args) => {
            let request = match args.command {
                cli::ModellerCommand::Pause => "modeller pause",
                cli::ModellerCommand::Continue => "modeller continue",
                cli::ModellerCommand::Status => "modeller status",
            };
            client::run_query_command(&config, request)
        }
        cli::Action::Modelled(args) => match args.command {
            cli::ModelledCommand::Apps => client::run_query_command(&config, "modelled apps"),
        },
        cli::Action::Abnormal(args) => match args.command {
            cli::AbnormalCommand::Apps { history } => {
                let request = if history {
                    "abnormal apps --history"
                } else {
                    "abnormal apps"
                };
                client::run_query_command(&config, request)
            }
        },
    }
}

fn do_start_action(config: &WadesConfig, config_path: Option<&std::path::Path>) {
    match daemon::spawn_daemon(config_path, &config.store_root) {
        Ok(pid) => println!("wades daemon started (pid {pid})."),
        Err(err) => {
            eprintln!("Could not start the daemon: {err}");
            std::process::exit(1)
        }
    }
}

fn do_stop_action(config: &WadesConfig) {
    match daemon::stop_daemon(&config.store_root) {
        Ok(pid) => println!("Sent termination signal to pid {pid}."),
        Err(err) => {
            eprintln!("Could not stop the daemon: {err}");
            std::process::exit(1)
        }
    }
}

#[cfg(any(target_os = "android", target_os = "linux"))]
fn do_run_action(config: &WadesConfig) {
    let pid_lock = match daemon::PidLock::acquire(&config.store_root) {
        Ok(lock) => lock,
        Err(err) => {
            eprintln!("Could not acquire the store lock: {err}");
            std::process::exit(1)
        }
    };
    let store = match store::ProfileStore::open(&config.store_root, &config.timestamp_format) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("Could not open the profile store: {err}");
            std::process::exit(1)
        }
    };

    let handle = controller::PipelineHandle::new();
    let (pipeline_shutdown_tx, pipeline_shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    let (listener_shutdown_tx, listener_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let listener_shutdown_tx = Arc::new(Mutex::new(Some(listener_shutdown_tx)));
    {
        let pipeline_tx = pipeline_shutdown_tx.clone();
        let listener_tx = listener_shutdown_tx.clone();
        ctrlc::set_handler(move || {
            let _ = pipeline_tx.try_send(());
            if let Some(tx) = listener_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        })
        .expect("couldn't install termination handler");
    }

    let sampler = sampler::Sampler::new(Box::new(linux::ProcfsProbe::new()));
    let detector = detector::FrequencyDetector::new(
        config.min_history,
        config.min_bin_support,
        config.prohibited_files.iter().cloned(),
    );
    let pipeline = controller::PipelineController::new(
        sampler,
        detector,
        store.clone(),
        config.sample_period(),
        config.detection_enabled,
        handle.clone(),
    );
    // If the pipeline dies on its own (fatal store failure), take the
    // listener down with it.
    let pipeline_thread = pipeline.spawn(pipeline_shutdown_rx, {
        let listener_tx = listener_shutdown_tx.clone();
        move || {
            if let Some(tx) = listener_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }
    });

    // Blocks until the termination handler fires.
    server::start_query_service_main(
        config.query_bind_address,
        config.query_port,
        store,
        handle,
        listener_shutdown_rx,
    );

    let _ = pipeline_shutdown_tx.try_send(());
    pipeline_thread
        .join()
        .expect("couldn't join pipeline thread");
    drop(pid_lock);
}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
fn do_run_action(_config: &WadesConfig) {
    eprintln!("Process sampling is only supported on Linux.");
    std::process::exit(1);
}
