// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

//! Sends a byte stream through an output and feeds everything that has
//! been sent back into an input.

use std::{sync::Arc, time::Duration};

use midiio::{
    transport::memory::MemoryTransport, ChannelConfig, MidiInput, MidiOutput, PumpThread,
    ShortMessage, DEFAULT_PUMP_INTERVAL,
};

const OUTPUT: &str = "Loopback Out";
const INPUT: &str = "Loopback In";

const STREAM: &[u8] = &[
    // Note on with running status
    0x90, 0x3c, 0x64, 0x40, 0x64, 0x43, 0x64, //
    // Timing clock between two messages
    0xf8, //
    // Identity request
    0xf0, 0x7e, 0x7f, 0x06, 0x01, 0xf7, //
    // Note off
    0x80, 0x3c, 0x00, 0x80, 0x40, 0x00, 0x80, 0x43, 0x00,
];

fn main() {
    pretty_env_logger::init();
    match run() {
        Ok(()) => (),
        Err(err) => println!("Error: {err}"),
    }
}

fn run() -> anyhow::Result<()> {
    let transport = MemoryTransport::new()
        .with_output(OUTPUT)
        .with_input(INPUT);
    let config = ChannelConfig::default().with_sysx_buffers(2, 64);

    let output = MidiOutput::open(&transport, OUTPUT, config.clone())?;
    let put_bytes = output.put_bytes(STREAM)?;
    println!(
        "Sent {accepted} of {len} byte(s)",
        accepted = put_bytes.accepted,
        len = STREAM.len()
    );
    for err in &put_bytes.errors {
        println!("Error: {err}");
    }

    let input = Arc::new(MidiInput::open(&transport, INPUT, config)?);
    let pump_thread = PumpThread::spawn(Arc::clone(&input), DEFAULT_PUMP_INTERVAL);
    for message in transport.sent_messages(OUTPUT) {
        let delivered = match ShortMessage::new(&message) {
            Some(short) => transport.inject_short(INPUT, short.pack()),
            None => transport.inject_sysx(INPUT, &message),
        };
        if !delivered {
            println!("Dropped {message:02x?}");
        }
        // Leave some time for rearming the SYSX buffers
        std::thread::sleep(Duration::from_millis(5));
    }
    pump_thread.abort_and_join()?;

    let mut buf = [0; 64];
    loop {
        let len = input.get_message(&mut buf)?;
        if len == 0 {
            break;
        }
        println!("Received {message:02x?}", message = &buf[..len]);
    }
    println!("{stats:?}", stats = input.stats()?);

    println!("Closing output: {shutdown:?}", shutdown = output.close());
    println!("Closing input: {shutdown:?}", shutdown = input.close());
    Ok(())
}
