mod config;
mod logging;
mod recorder;

use config::HostConfig;
use rtport_engine::{Backend, EngineState};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn wire(backend: &Backend, host: &HostConfig) {
    let registry = backend.registry();
    if host.monitor.passthrough {
        for n in 1.. {
            let capture = format!("system:capture_{n}");
            let playback = format!("system:playback_{n}");
            if registry.port_by_name(&capture).is_none() || registry.port_by_name(&playback).is_none() {
                break;
            }
            if let Err(e) = registry.connect_by_name(&capture, &playback) {
                warn!("passthrough {capture} -> {playback}: {e}");
            }
        }
    }
    if host.monitor.record.is_some() {
        for n in 1.. {
            let capture = format!("system:capture_{n}");
            let record = format!("system:record_{n}");
            if registry.port_by_name(&capture).is_none() || registry.port_by_name(&record).is_none() {
                break;
            }
            if let Err(e) = registry.connect_by_name(&capture, &record) {
                warn!("record {capture}: {e}");
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let host = match HostConfig::load(path.as_deref()) {
        Ok(host) => host,
        Err(e) => {
            eprintln!("rtport: {e}");
            std::process::exit(2);
        }
    };
    logging::init(host.log.as_deref());

    let mut backend = Backend::new(host.backend.clone());
    let mut recording = None;
    if host.monitor.record.is_some() {
        let channels = match host.backend.driver.input_channels {
            0 => 2,
            n => n,
        };
        match recorder::recorder(
            backend.registry(),
            channels,
            host.backend.driver.sample_rate,
            host.monitor.record_seconds,
        ) {
            Ok((handler, rec)) => {
                if let Err(e) = backend.set_process_handler(handler) {
                    error!("{e}");
                }
                recording = Some(rec);
            }
            Err(e) => error!("recorder: {e}"),
        }
    }

    if let Err(e) = backend.start() {
        error!("{e}");
        backend.drain_diagnostics();
        std::process::exit(1);
    }
    wire(&backend, &host);
    info!("running; press Ctrl-C to stop");

    let mut failed_slaves: Vec<String> = Vec::new();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = ticker.tick() => {
                backend.drain_diagnostics();
                if let Some(rec) = recording.as_mut() {
                    rec.collect();
                }
                for slave in &host.backend.slaves {
                    if backend.slave_failed(&slave.name) && !failed_slaves.contains(&slave.name) {
                        error!("slave {} failed; its ports carry silence", slave.name);
                        failed_slaves.push(slave.name.clone());
                    }
                }
                if backend.state() == EngineState::Stopping {
                    warn!("engine halted");
                    break;
                }
            }
        }
    }

    if let Err(e) = backend.stop() {
        warn!("{e}");
    }
    backend.drain_diagnostics();

    if let (Some(mut rec), Some(dst)) = (recording, host.monitor.record.as_ref()) {
        rec.collect();
        if rec.dropped_frames() > 0 {
            warn!("recording lost {} frames", rec.dropped_frames());
        }
        match wavers::write::<f32, _>(
            dst,
            rec.samples(),
            backend.sample_rate() as i32,
            rec.channels() as u16,
        ) {
            Ok(()) => info!("wrote {}", dst.display()),
            Err(e) => error!("failed to write '{}': {e}", dst.display()),
        }
    }
}
