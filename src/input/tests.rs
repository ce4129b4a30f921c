// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use super::*;
use crate::{
    transport::{memory::MemoryTransport, TransportCall, TransportEvent},
    CorrelationToken, PumpThread, ShortMessage,
};

const DEVICE: &str = "Loopback In";

fn transport() -> MemoryTransport {
    MemoryTransport::new()
        .with_input(DEVICE)
        .with_input("Keyboard")
}

fn config() -> ChannelConfig {
    ChannelConfig::default().with_shutdown_budget(5, Duration::from_millis(1))
}

fn packed(bytes: &[u8]) -> u32 {
    ShortMessage::new(bytes).unwrap().pack()
}

fn read_all(input: &MidiInput) -> Vec<Vec<u8>> {
    let mut messages = Vec::new();
    let mut out = [0; 256];
    loop {
        let len = input.get_message(&mut out).unwrap();
        if len == 0 {
            return messages;
        }
        messages.push(out[..len].to_vec());
    }
}

#[test]
fn short_messages_in_order() {
    let transport = transport();
    let input = MidiInput::open(&transport, DEVICE, config()).unwrap();
    assert_eq!(DEVICE, input.device_name().unwrap());
    assert!(transport.inject_short(DEVICE, packed(&[0x90, 0x3c, 0x64])));
    assert!(transport.inject_short(DEVICE, packed(&[0xc0, 0x05])));
    assert!(transport.inject_short(DEVICE, packed(&[0xf8])));
    assert!(transport.inject_short(DEVICE, packed(&[0xb0, 0x07, 0x7f])));
    assert_eq!(
        vec![
            vec![0x90, 0x3c, 0x64],
            vec![0xc0, 0x05],
            vec![0xf8],
            vec![0xb0, 0x07, 0x7f],
        ],
        read_all(&input)
    );
    let stats = input.stats().unwrap();
    assert_eq!(4, stats.short_messages);
    assert_eq!(0, stats.malformed);
}

#[test]
fn sysx_round_trip() {
    let transport = transport();
    let input = MidiInput::open(&transport, DEVICE, config()).unwrap();
    assert_eq!(4, transport.armed_input_buffers(DEVICE));
    assert!(transport.inject_sysx(DEVICE, &[0xf0, 0x43, 0x12, 0x00, 0xf7]));
    assert_eq!(3, transport.armed_input_buffers(DEVICE));
    let mut out = [0; 16];
    assert_eq!(5, input.get_message(&mut out).unwrap());
    assert_eq!(&[0xf0, 0x43, 0x12, 0x00, 0xf7], &out[..5]);
    // The returned buffer has been armed again
    assert_eq!(4, transport.armed_input_buffers(DEVICE));
    assert_eq!(1, input.stats().unwrap().sysx_buffers);
}

#[test]
fn continuous_sysx_is_not_lost() {
    let transport = transport();
    let input = MidiInput::open(
        &transport,
        DEVICE,
        config().with_sysx_buffers(1, 16).with_ring_buffer_size(256),
    )
    .unwrap();
    input.pump().unwrap();
    for i in 0..10 {
        assert!(transport.inject_sysx(DEVICE, &[0xf0, 0x7d, i, 0xf7]));
        // Re-armed while pumping
        assert_eq!(1, input.pump().unwrap());
    }
    let messages = read_all(&input);
    assert_eq!(10, messages.len());
    assert_eq!(vec![0xf0, 0x7d, 9, 0xf7], messages[9]);
}

#[test]
fn long_sysx_spans_multiple_buffers() {
    let transport = transport();
    let input = MidiInput::open(
        &transport,
        DEVICE,
        config().with_sysx_buffers(4, 8).with_ring_buffer_size(64),
    )
    .unwrap();
    let sysx = [0xf0, 0x41, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0xf7];
    assert!(transport.inject_sysx(DEVICE, &sysx));
    assert_eq!(vec![sysx[..8].to_vec(), sysx[8..].to_vec()], read_all(&input));
}

#[test]
fn unterminated_sysx_is_delayed() {
    let transport = transport();
    let input = MidiInput::open(
        &transport,
        DEVICE,
        config().with_sysx_buffers(2, 4).with_ring_buffer_size(16),
    )
    .unwrap();
    assert!(transport.inject_sysx(DEVICE, &[0xf0, 0x01, 0x02]));
    let mut out = [0; 8];
    assert_eq!(0, input.get_message(&mut out).unwrap());
    assert!(transport.inject_sysx(DEVICE, &[0x03, 0xf7]));
    // Maximum size reached
    assert_eq!(4, input.get_message(&mut out).unwrap());
    assert_eq!(&[0xf0, 0x01, 0x02, 0x03], &out[..4]);
    assert_eq!(1, input.get_message(&mut out).unwrap());
    assert_eq!(0xf7, out[0]);
}

#[test]
fn truncate_to_output_buffer() {
    let transport = transport();
    let input = MidiInput::open(&transport, DEVICE, config()).unwrap();
    assert!(transport.inject_short(DEVICE, packed(&[0xe0, 0x00, 0x40])));
    assert!(transport.inject_short(DEVICE, packed(&[0xfe])));
    let mut out = [0; 2];
    assert_eq!(2, input.get_message(&mut out).unwrap());
    assert_eq!([0xe0, 0x00], out);
    assert_eq!(1, input.get_message(&mut out).unwrap());
    assert_eq!(0xfe, out[0]);
}

#[test]
fn raw_byte_reads() {
    let transport = transport();
    let input = MidiInput::open(&transport, DEVICE, config()).unwrap();
    assert_eq!(None, input.get_byte().unwrap());
    assert!(transport.inject_short(DEVICE, packed(&[0x80, 0x3c, 0x40])));
    assert_eq!(Some(0x80), input.get_byte().unwrap());
    let mut out = [0; 8];
    assert_eq!(2, input.get_bytes(&mut out).unwrap());
    assert_eq!(&[0x3c, 0x40], &out[..2]);
}

#[test]
fn full_event_queue_drops_short_messages() {
    let transport = transport();
    let input = MidiInput::open(
        &transport,
        DEVICE,
        config()
            .with_sysx_buffers(1, 16)
            .with_event_queue_capacity(2),
    )
    .unwrap();
    input.pump().unwrap();
    assert!(transport.inject_short(DEVICE, packed(&[0xf8])));
    assert!(transport.inject_short(DEVICE, packed(&[0xfa])));
    assert!(!transport.inject_short(DEVICE, packed(&[0xfc])));
    assert_eq!(vec![vec![0xf8], vec![0xfa]], read_all(&input));
}

#[test]
fn close_with_full_event_queue() {
    let transport = transport();
    let input = MidiInput::open(
        &transport,
        DEVICE,
        config()
            .with_sysx_buffers(4, 16)
            .with_event_queue_capacity(8),
    )
    .unwrap();
    input.pump().unwrap();
    for note in 0..8 {
        assert!(transport.inject_short(DEVICE, packed(&[0x90, note, 0x40])));
    }
    let started = Instant::now();
    assert_eq!(Shutdown::Graceful, input.close());
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!transport.is_input_open(DEVICE));
}

#[test]
fn read_in_order_while_pumping_concurrently() {
    const COUNT: u16 = 5_000;

    let transport = transport();
    let input = Arc::new(
        MidiInput::open(
            &transport,
            DEVICE,
            config()
                .with_ring_buffer_size(65_536)
                .with_event_queue_capacity(64),
        )
        .unwrap(),
    );
    let pump_thread = PumpThread::spawn(Arc::clone(&input), Duration::from_millis(1));
    let producer = std::thread::spawn({
        let transport = transport.clone();
        move || {
            for i in 0..COUNT {
                let note = u8::try_from(i % 128).unwrap();
                let velocity = u8::try_from(i / 128).unwrap();
                let message = packed(&[0x90, note, velocity]);
                while !transport.inject_short(DEVICE, message) {
                    std::thread::yield_now();
                }
            }
        }
    });
    let mut expected = 0;
    let mut out = [0; 3];
    let started = Instant::now();
    while expected < COUNT && started.elapsed() < Duration::from_secs(10) {
        if input.get_message(&mut out).unwrap() == 0 {
            std::thread::yield_now();
            continue;
        }
        let received = u16::from(out[2]) * 128 + u16::from(out[1]);
        assert_eq!(expected, received);
        expected += 1;
    }
    producer.join().unwrap();
    pump_thread.abort_and_join().unwrap();
    assert_eq!(COUNT, expected);
}

#[test]
fn full_ring_buffer_rejects_input() {
    let transport = transport();
    let input = MidiInput::open(
        &transport,
        DEVICE,
        config().with_ring_buffer_size(8).with_sysx_buffers(1, 8),
    )
    .unwrap();
    for note in 0x3c..0x3f {
        assert!(transport.inject_short(DEVICE, packed(&[0x90, note, 0x64])));
    }
    input.pump().unwrap();
    assert_eq!(3, input.stats().unwrap().overrun_bytes);
    assert_eq!(
        vec![vec![0x90, 0x3c, 0x64], vec![0x90, 0x3d, 0x64]],
        read_all(&input)
    );
}

#[test]
fn transport_errors_are_counted() {
    let transport = transport();
    let input = MidiInput::open(&transport, DEVICE, config()).unwrap();
    assert!(transport.inject_error(DEVICE, 42));
    input.pump().unwrap();
    assert_eq!(1, input.stats().unwrap().transport_errors);
}

#[test]
fn reset_discards_input_and_rearms() {
    let transport = transport();
    let input = MidiInput::open(&transport, DEVICE, config()).unwrap();
    assert!(transport.inject_short(DEVICE, packed(&[0x90, 0x3c, 0x64])));
    input.pump().unwrap();
    assert!(input.reset().unwrap().is_graceful());
    let mut out = [0; 4];
    assert_eq!(0, input.get_message(&mut out).unwrap());
    assert_eq!(4, transport.armed_input_buffers(DEVICE));
    assert!(transport.inject_sysx(DEVICE, &[0xf0, 0x7e, 0xf7]));
    assert_eq!(3, input.get_message(&mut out).unwrap());
}

#[test]
fn open_errors() {
    let transport = transport();
    assert!(matches!(
        MidiInput::open(&transport, "(None)", config()),
        Err(Error::NoDeviceSelected)
    ));
    assert!(matches!(
        MidiInput::open(&transport, "Theremin", config()),
        Err(Error::DeviceNotFound { name }) if name == "Theremin"
    ));
    let _input = MidiInput::open(&transport, DEVICE, config()).unwrap();
    assert!(matches!(
        MidiInput::open(&transport, DEVICE, config()),
        Err(Error::DeviceBusy { .. })
    ));
    assert!(matches!(
        MidiInput::open(&transport, "Keyboard", config().with_sysx_buffers(0, 16)),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn open_default_device() {
    let transport = transport();
    let input = MidiInput::open(&transport, "MIDI Mapper", config()).unwrap();
    assert_eq!("MIDI Mapper", input.device_name().unwrap());
    assert!(transport.is_input_open(DEVICE));
}

#[test]
fn failing_start_closes_device() {
    let transport = transport();
    transport.fail_next(TransportCall::Start);
    assert!(matches!(
        MidiInput::open(&transport, DEVICE, config()),
        Err(Error::TransportCallFailed(err)) if err.call == TransportCall::Start
    ));
    assert!(!transport.is_input_open(DEVICE));
}

#[test]
fn close_and_reopen() {
    let transport = transport();
    let input = MidiInput::open(&transport, DEVICE, config()).unwrap();
    assert!(input.close().is_graceful());
    assert!(!transport.is_input_open(DEVICE));
    assert!(matches!(input.get_message(&mut [0; 4]), Err(Error::Closed)));
    assert!(matches!(input.pump(), Err(Error::Closed)));
    // Closing twice does nothing
    assert!(input.close().is_graceful());

    assert!(input.reopen(&transport, "Keyboard").unwrap().is_graceful());
    assert!(transport.is_input_open("Keyboard"));
    assert!(transport.inject_short("Keyboard", packed(&[0x90, 0x40, 0x7f])));
    assert_eq!(vec![vec![0x90, 0x40, 0x7f]], read_all(&input));
}

#[test]
fn drop_closes_device() {
    let transport = transport();
    drop(MidiInput::open(&transport, DEVICE, config()).unwrap());
    assert!(!transport.is_input_open(DEVICE));
}

#[test]
fn close_times_out_with_pending_transfers() {
    let transport = transport();
    let input = MidiInput::open(&transport, DEVICE, config()).unwrap();
    transport.set_stall_on_reset(true);
    let started = Instant::now();
    assert_eq!(Shutdown::TimedOut { pending: 4 }, input.close());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!transport.is_input_open(DEVICE));
}

mod defragmenter {
    use super::*;
    use crate::transport::{event_queue, DeviceSelector};

    fn stale_completion(bytes: &[u8]) -> TransportEvent {
        let mut buf = bytes.to_vec();
        let len = buf.len();
        buf.resize(16, 0);
        TransportEvent::LongDataCompleted {
            token: CorrelationToken::from_bits(0xdead_0000),
            buf,
            len,
        }
    }

    fn read_all(defragmenter: &mut InputDefragmenter) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        let mut out = [0; 16];
        loop {
            let len = defragmenter.get_message(&mut out);
            if len == 0 {
                return messages;
            }
            messages.push(out[..len].to_vec());
        }
    }

    #[test]
    fn deliver_payload_of_stale_completion() {
        let transport = transport();
        let (events, _receiver) = event_queue(8);
        let mut port = transport
            .open_input(&DeviceSelector::Default, events)
            .unwrap();
        let mut defragmenter = InputDefragmenter::new(&config());
        defragmenter.handle_event(stale_completion(&[0xf0, 0x01, 0xf7]), port.as_mut());
        assert_eq!(1, defragmenter.stats().stale_completions);
        assert_eq!(vec![vec![0xf0, 0x01, 0xf7]], read_all(&mut defragmenter));
    }

    #[test]
    fn data_bytes_under_running_status() {
        let transport = transport();
        let (events, _receiver) = event_queue(8);
        let mut port = transport
            .open_input(&DeviceSelector::Default, events)
            .unwrap();
        let mut defragmenter = InputDefragmenter::new(&config());
        defragmenter.handle_event(
            stale_completion(&[0x90, 0x3c, 0x64, 0x3e, 0x64, 0xc1, 0x02, 0x03]),
            port.as_mut(),
        );
        assert_eq!(
            vec![
                vec![0x90, 0x3c, 0x64],
                vec![0x3e, 0x64],
                vec![0xc1, 0x02],
                vec![0x03],
            ],
            read_all(&mut defragmenter)
        );
        assert_eq!(Some(0xc1), defragmenter.running_status());
    }

    #[test]
    fn skip_invalid_bytes() {
        let transport = transport();
        let (events, _receiver) = event_queue(8);
        let mut port = transport
            .open_input(&DeviceSelector::Default, events)
            .unwrap();
        let mut defragmenter = InputDefragmenter::new(&config());
        defragmenter.handle_event(
            stale_completion(&[0x3c, 0xf5, 0xf7, 0xf6, 0x01]),
            port.as_mut(),
        );
        assert_eq!(vec![vec![0xf6]], read_all(&mut defragmenter));
        assert_eq!(4, defragmenter.stats().malformed);
        assert_eq!(0, defragmenter.buffered());
    }

    #[test]
    fn resync_after_undefined_status() {
        let transport = transport();
        let (events, _receiver) = event_queue(8);
        let mut port = transport
            .open_input(&DeviceSelector::Default, events)
            .unwrap();
        let mut defragmenter = InputDefragmenter::new(&config());
        defragmenter.handle_event(
            stale_completion(&[0xf5, 0x80, 0x3c, 0x40]),
            port.as_mut(),
        );
        assert_eq!(vec![vec![0x80, 0x3c, 0x40]], read_all(&mut defragmenter));
        assert_eq!(1, defragmenter.stats().malformed);
        assert_eq!(0, defragmenter.buffered());
    }

    #[test]
    fn real_time_inside_sysx() {
        let transport = transport();
        let (events, _receiver) = event_queue(8);
        let mut port = transport
            .open_input(&DeviceSelector::Default, events)
            .unwrap();
        let mut defragmenter = InputDefragmenter::new(&config());
        defragmenter.handle_event(
            stale_completion(&[0xf0, 0x01, 0xf8, 0x02, 0xf7]),
            port.as_mut(),
        );
        assert_eq!(
            vec![vec![0xf0, 0x01], vec![0xf8], vec![0x02, 0xf7]],
            read_all(&mut defragmenter)
        );
    }

    #[test]
    fn malformed_short_data_is_discarded() {
        let transport = transport();
        let (events, _receiver) = event_queue(8);
        let mut port = transport
            .open_input(&DeviceSelector::Default, events)
            .unwrap();
        let mut defragmenter = InputDefragmenter::new(&config());
        for packed in [0x0000_00f0, 0x0000_00f5, 0x0000_0040, 0x0000_9090] {
            defragmenter.handle_event(
                TransportEvent::ShortDataReceived { packed },
                port.as_mut(),
            );
        }
        assert_eq!(4, defragmenter.stats().malformed);
        assert_eq!(0, defragmenter.buffered());
    }
}
