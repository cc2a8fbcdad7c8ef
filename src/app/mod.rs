use crate::config::Config;
use crate::device::{liveness, session, DeviceHub, LogSink, Timing};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
        return Err(format!("unknown command: {command}").into());
    }

    let config = Config::load()?;
    let hub = DeviceHub::new(Timing::from(&config.timing), Arc::new(LogSink));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let device_addr = config.device_addr()?;
    let device_listener = TcpListener::bind(device_addr).await?;
    tracing::info!(addr = %device_addr, "device tcp listener bound");
    let device_task = tokio::spawn(session::serve(
        device_listener,
        hub.clone(),
        shutdown_rx.clone(),
    ));

    let liveness_task = tokio::spawn(liveness::run(hub.clone(), shutdown_rx.clone()));

    if config.discovery.enabled {
        let advertise = match config.discovery.advertise_ip.as_deref() {
            Some(ip) => ip.trim().parse::<IpAddr>()?,
            None => crate::discovery::detect_local_ip(),
        };
        match crate::discovery::bind(config.discovery.port).await {
            Ok(socket) => {
                tokio::spawn(crate::discovery::run(socket, advertise, shutdown_rx.clone()));
            }
            Err(err) => {
                tracing::warn!(port = config.discovery.port, error = %err, "discovery disabled, bind failed");
            }
        }
    }

    let http_addr = config.http_addr()?;
    let result = tokio::select! {
        res = crate::server::start(http_addr, hub.clone(), shutdown_rx.clone()) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            Ok(())
        }
    };

    let _ = shutdown_tx.send(true);
    hub.clear_connections();
    liveness_task.await?;
    match device_task.await? {
        Ok(()) => {}
        Err(err) => tracing::warn!(error = %err, "device listener stopped with error"),
    }
    result
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
