//! MIDI written to a dummy playback port comes back on its capture twin,
//! through the output thread, the in-memory pipe, the parser and the input
//! thread.

#[cfg(test)]
mod tests {
    use midly::MidiMessage;
    use midly::live::LiveEvent;
    use rtport_engine::{
        Backend, BackendConfig, Control, DataType, DriverOptions, DummyOptions, PortFlags,
        ProcessScope,
    };
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn note_on_and_sysex_loop_back_through_the_dummy_pipe() {
        let mut backend = Backend::new(BackendConfig {
            driver: DriverOptions {
                period_frames: 128,
                dummy: DummyOptions {
                    midi_ports: 1,
                    ..Default::default()
                },
                ..Default::default()
            },
            rt_priority: None,
            ..Default::default()
        });
        let reg = backend.registry().clone();
        let out = reg
            .register_port("keys_out", DataType::Midi, PortFlags::IS_OUTPUT)
            .unwrap();
        let inp = reg
            .register_port("keys_in", DataType::Midi, PortFlags::IS_INPUT)
            .unwrap();

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let mut cycle = 0_u32;
        backend
            .set_process_handler(move |scope: &mut ProcessScope<'_>| {
                cycle += 1;
                if cycle == 20
                    && let Some(buf) = scope.midi_output(out)
                {
                    let _ = buf.put(3, &[0x90, 0x3C, 0x64]);
                    let _ = buf.put(9, &[0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7]);
                }
                if let Some(buf) = scope.midi_input(inp) {
                    for event in buf {
                        let _ = tx.send(event.bytes().to_vec());
                    }
                }
                Control::Continue
            })
            .unwrap();
        backend.start().unwrap();
        reg.connect_by_name("system:keys_out", "system:midi_playback_dummy_1")
            .unwrap();
        reg.connect_by_name("system:midi_capture_dummy_1", "system:keys_in")
            .unwrap();

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        backend.stop().unwrap();

        match LiveEvent::parse(&first).unwrap() {
            LiveEvent::Midi {
                channel,
                message: MidiMessage::NoteOn { key, vel },
            } => {
                assert_eq!(channel.as_int(), 0);
                assert_eq!(key.as_int(), 0x3C);
                assert_eq!(vel.as_int(), 0x64);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(second, vec![0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7]);
        assert!(matches!(
            LiveEvent::parse(&second).unwrap(),
            LiveEvent::Common(midly::live::SystemCommon::SysEx(_))
        ));
    }

    #[test]
    fn capture_port_is_physical_and_reports_one_period_of_latency() {
        let mut backend = Backend::new(BackendConfig {
            driver: DriverOptions {
                period_frames: 128,
                dummy: DummyOptions {
                    midi_ports: 2,
                    ..Default::default()
                },
                ..Default::default()
            },
            rt_priority: None,
            ..Default::default()
        });
        backend.start().unwrap();
        let reg = backend.registry().clone();
        let names = reg
            .get_ports("midi_capture", Some(DataType::Midi), PortFlags::IS_PHYSICAL)
            .unwrap();
        assert_eq!(
            names,
            vec![
                "system:midi_capture_dummy_1".to_string(),
                "system:midi_capture_dummy_2".to_string()
            ]
        );
        let id = reg.port_by_name("system:midi_capture_dummy_2").unwrap();
        assert_eq!(reg.latency_range(id, false).unwrap().max, 128);
        assert_eq!(reg.n_physical_outputs().midi, 2);
        backend.stop().unwrap();
    }
}
