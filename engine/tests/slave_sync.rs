//! A second dummy device running 0.1% fast is resampled onto the master clock.

#[cfg(test)]
mod tests {
    use rtport_engine::diag::DiagnosticHub;
    use rtport_engine::hw::DummyDriver;
    use rtport_engine::hw::traits::{HwDriver, WaitStatus};
    use rtport_engine::sync::{SyncPhase, slave_pair};
    use rtport_engine::{
        Backend, BackendConfig, Control, DataType, DriverOptions, DummyOptions, Generator,
        PortFlags, ProcessScope, SlaveConfig,
    };
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    fn master() -> DriverOptions {
        DriverOptions {
            period_frames: 256,
            input_channels: 1,
            output_channels: 1,
            ..Default::default()
        }
    }

    fn slave() -> SlaveConfig {
        SlaveConfig {
            name: "fast".to_string(),
            driver: DriverOptions {
                period_frames: 256,
                input_channels: 1,
                output_channels: 1,
                dummy: DummyOptions {
                    speed: 1.001,
                    generator: Generator::Sine {
                        frequency: 440.0,
                        amplitude: 0.5,
                    },
                    ..Default::default()
                },
                ..Default::default()
            },
            dll_bandwidth: 1.0,
            ..Default::default()
        }
    }

    #[test]
    #[ignore = "runs for several seconds of wall-clock time"]
    fn fast_slave_locks_and_delivers_audio() {
        let mut backend = Backend::new(BackendConfig {
            driver: master(),
            rt_priority: None,
            slaves: vec![slave()],
            ..Default::default()
        });

        // 1. A client input that listens to the slave's capture port.
        let reg = backend.registry().clone();
        let monitor = reg
            .register_port("monitor", DataType::Audio, PortFlags::IS_INPUT)
            .unwrap();
        let loud = Arc::new(AtomicU32::new(0));
        let counter = loud.clone();
        backend
            .set_process_handler(move |scope: &mut ProcessScope<'_>| {
                if let Some(input) = scope.audio_input(monitor) {
                    let energy: f32 = input.iter().map(|s| s * s).sum();
                    if energy / input.len() as f32 > 0.05 {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Control::Continue
            })
            .unwrap();
        backend.start().unwrap();

        // 2. The slave's ports follow the master's.
        assert!(reg.port_by_name("system:capture_2").is_some());
        assert!(reg.port_by_name("system:playback_2").is_some());
        reg.connect_by_name("system:capture_2", "system:monitor")
            .unwrap();

        // 3. Let the loop lock, then watch the audio flow.
        std::thread::sleep(Duration::from_secs(3));
        let (phase, speed) = backend.slave_status("fast").unwrap();
        assert_eq!(phase, SyncPhase::Running);
        assert!((speed - 1.001).abs() < 5e-4, "speed {speed}");

        let before = loud.load(Ordering::Relaxed);
        let started = Instant::now();
        std::thread::sleep(Duration::from_secs(1));
        let cycles = (loud.load(Ordering::Relaxed) - before) as f64;
        let expected = started.elapsed().as_secs_f64() * 48_000.0 / 256.0;
        assert!(cycles > expected * 0.9, "{cycles} of {expected} cycles carried audio");

        assert!(!backend.slave_failed("fast"));
        backend.stop().unwrap();
    }

    #[test]
    fn converged_slave_delivers_a_full_period_every_cycle() {
        let hub = DiagnosticHub::new();
        let mut options = slave().driver;
        options.dummy.realtime = false;
        let mut driver = DummyDriver::new(&options).unwrap();
        driver.start().unwrap();
        let (mut link, mut worker) =
            slave_pair(&slave(), driver, 48_000, 256, hub.register("fast")).unwrap();
        let mut diag = hub.register("process");

        // Simulated clocks: the slave finishes a period 0.1% sooner.
        let period_us = 256.0 * 1_000_000.0 / 48_000.0;
        let mut slave_next = 0.0;
        let mut short_cycles = Vec::new();
        for cycle in 0..4_000 {
            let master_now = cycle as f64 * period_us;
            while slave_next <= master_now {
                let status = WaitStatus {
                    available: 256,
                    xrun: false,
                };
                worker.on_period(1_000 + slave_next as u64, status).unwrap();
                slave_next += period_us / 1.001;
            }
            let full = link.pull_capture(1.0, &mut diag);
            link.playback_channel(0).fill(0.1);
            let sent = link.push_playback(1.0, &mut diag);
            if cycle >= 1_000 {
                assert_eq!(link.capture_channel(0).len(), 256);
                if !(full && sent) {
                    short_cycles.push(cycle);
                }
            }
        }

        assert!(short_cycles.is_empty(), "cycles without a full period: {short_cycles:?}");
        assert_eq!(link.phase(), SyncPhase::Running);
        assert!((link.slave_speed() - 1.001).abs() < 1e-4, "{}", link.slave_speed());
    }

    #[test]
    fn slave_with_a_bad_config_is_refused() {
        let mut backend = Backend::new(BackendConfig {
            driver: master(),
            rt_priority: None,
            ..Default::default()
        });
        let mut bad = slave();
        bad.ring_periods = 2;
        assert!(backend.add_slave(bad).is_err());
        assert!(backend.config().slaves.is_empty());

        backend.add_slave(slave()).unwrap();
        backend.start().unwrap();
        assert!(backend.slave_status("fast").is_some());
        backend.remove_slave("fast").unwrap();
        assert!(backend.slave_status("fast").is_none());
        assert!(reg_has_no_slave_ports(&backend));
        backend.stop().unwrap();
    }

    fn reg_has_no_slave_ports(backend: &Backend) -> bool {
        backend
            .registry()
            .port_by_name("system:capture_2")
            .is_none()
    }
}
