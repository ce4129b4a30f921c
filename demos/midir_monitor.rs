// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

use std::{
    io::{stdin, stdout, Write as _},
    time::{Duration, Instant},
};

use midiio::{
    transport::midir::MidirTransport, ChannelConfig, MessageClass, MidiInput, Transport as _,
};

const MONITOR_DURATION: Duration = Duration::from_secs(30);

fn main() {
    pretty_env_logger::init();
    match run() {
        Ok(()) => (),
        Err(err) => println!("Error: {err}"),
    }
}

fn select_device(transport: &MidirTransport) -> anyhow::Result<Option<String>> {
    let mut device_names = transport.input_device_names();
    match device_names.len() {
        0 => anyhow::bail!("No MIDI input devices found"),
        1 => {
            println!(
                "Choosing the only available input: {device_name}",
                device_name = device_names[0],
            );
            Ok(Some(device_names.remove(0)))
        }
        _ => {
            println!("\nAvailable inputs:");
            for (i, device_name) in device_names.iter().enumerate() {
                println!("{device_number}: {device_name}", device_number = i + 1);
            }
            print!("Please select an input: ");
            stdout().flush()?;
            let mut input = String::new();
            stdin().read_line(&mut input)?;
            let device_number = input.trim().parse::<usize>()?;
            if device_number < 1 || device_number > device_names.len() {
                eprintln!("Unknown device number {device_number}");
                return Ok(None);
            }
            Ok(Some(device_names.remove(device_number - 1)))
        }
    }
}

fn run() -> anyhow::Result<()> {
    let transport = MidirTransport::new("midiio monitor");
    let Some(device_name) = select_device(&transport)? else {
        return Ok(());
    };
    let input = MidiInput::open(&transport, &device_name, ChannelConfig::default())?;
    println!("Monitoring \"{device_name}\" for {MONITOR_DURATION:?}");

    let started = Instant::now();
    let mut buf = [0; 256];
    while started.elapsed() < MONITOR_DURATION {
        input.pump_timeout(Duration::from_millis(100))?;
        loop {
            let len = input.get_message(&mut buf)?;
            if len == 0 {
                break;
            }
            let message = &buf[..len];
            println!(
                "{elapsed:>8.3}s {class:?}: {message:02x?}",
                elapsed = started.elapsed().as_secs_f64(),
                class = MessageClass::of(message[0]),
            );
        }
    }

    println!("{stats:?}", stats = input.stats()?);
    println!("Closing input: {shutdown:?}", shutdown = input.close());
    Ok(())
}
