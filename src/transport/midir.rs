// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

//! Transport driven by [`midir`]
//!
//! midir delivers complete messages from its own callback thread and sends
//! synchronously. SYSX input is recorded into the armed buffers that are
//! queued by the channel, SYSX output completes immediately after sending.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use midir::{
    ConnectError, ConnectErrorKind, Ignore, MidiInput, MidiInputConnection, MidiOutput,
    MidiOutputConnection,
};
use parking_lot::Mutex;

use super::{
    BoxedInputPort, BoxedOutputPort, DeviceSelector, EventSender, InputPort, LongBufferPort,
    OpenError, OutputPort, SubmitError, Transport, TransportCall, TransportError, TransportEvent,
    TransportResult,
};
use crate::{
    message::{is_status_byte, SYSTEM_EXCLUSIVE},
    CorrelationToken, ShortMessage,
};

/// Control change "All Notes Off"
const ALL_NOTES_OFF: u8 = 0x7b;

fn transport_error(call: TransportCall, err: impl fmt::Display) -> TransportError {
    TransportError::new(call, TransportError::UNSPECIFIED, err.to_string())
}

fn not_connected(call: TransportCall) -> TransportError {
    TransportError::new(call, TransportError::UNSPECIFIED, "not connected")
}

fn connect_error<T>(err: &ConnectError<T>) -> OpenError {
    match err.kind() {
        ConnectErrorKind::InvalidPort => OpenError::NotFound,
        ConnectErrorKind::Other(msg) => {
            log::warn!("Failed to connect port: {msg}");
            OpenError::Busy
        }
    }
}

fn select_port<P>(
    ports: Vec<P>,
    port_name: impl Fn(&P) -> Option<String>,
    device: &DeviceSelector,
) -> Result<P, OpenError> {
    match device {
        DeviceSelector::Disabled => None,
        DeviceSelector::Default => ports.into_iter().next(),
        DeviceSelector::Named(name) => ports
            .into_iter()
            .find(|port| port_name(port).as_deref() == Some(name.as_str())),
    }
    .ok_or(OpenError::NotFound)
}

#[derive(Debug, Default)]
struct InputShared {
    active: AtomicBool,
    armed: Mutex<VecDeque<(CorrelationToken, Vec<u8>)>>,
}

impl InputShared {
    fn pop_armed(&self) -> Option<(CorrelationToken, Vec<u8>)> {
        self.armed.lock().pop_front()
    }

    fn return_armed(&self, events: &EventSender) {
        let armed = std::mem::take(&mut *self.armed.lock());
        for (token, buf) in armed {
            events.send(TransportEvent::LongDataCompleted { token, buf, len: 0 });
        }
    }
}

#[derive(Debug)]
struct InputHandler {
    shared: Arc<InputShared>,
    events: EventSender,
}

impl InputHandler {
    fn record_sysx(&self, mut input: &[u8]) {
        while !input.is_empty() {
            let Some((token, mut buf)) = self.shared.pop_armed() else {
                log::warn!(
                    "No SYSX buffer available, discarding {len} byte(s)",
                    len = input.len()
                );
                return;
            };
            let len = input.len().min(buf.len());
            buf[..len].copy_from_slice(&input[..len]);
            input = &input[len..];
            self.events
                .send(TransportEvent::LongDataCompleted { token, buf, len });
        }
    }
}

// Adapter for the midir callback closure
fn handle_input(micros: u64, input: &[u8], handler: &mut InputHandler) {
    log::trace!("Received MIDI input: {micros} {input:0x?}");
    if !handler.shared.active.load(Ordering::Acquire) {
        return;
    }
    let Some(&first) = input.first() else {
        return;
    };
    // Long SYSX messages might arrive in multiple fragments
    if first == SYSTEM_EXCLUSIVE || !is_status_byte(first) {
        handler.record_sysx(input);
        return;
    }
    if let Some(message) = ShortMessage::new(input) {
        handler.events.send_short(message.pack());
    } else {
        log::warn!("Unhandled MIDI input {micros} {input:x?}");
    }
}

#[allow(missing_debug_implementations)]
struct MidirInputPort {
    connection: Option<MidiInputConnection<InputHandler>>,
    shared: Arc<InputShared>,
    events: EventSender,
}

impl LongBufferPort for MidirInputPort {
    fn submit_long(
        &mut self,
        token: CorrelationToken,
        buf: Vec<u8>,
        _len: usize,
    ) -> Result<(), SubmitError> {
        if self.connection.is_none() {
            return Err(SubmitError {
                err: not_connected(TransportCall::SubmitLong),
                buf,
            });
        }
        self.shared.armed.lock().push_back((token, buf));
        Ok(())
    }

    fn reset(&mut self) -> TransportResult<()> {
        self.shared.active.store(false, Ordering::Release);
        self.shared.return_armed(&self.events);
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        let Some(connection) = self.connection.take() else {
            return Err(not_connected(TransportCall::Close));
        };
        self.shared.active.store(false, Ordering::Release);
        let (_input, _handler) = connection.close();
        self.shared.return_armed(&self.events);
        self.events.send(TransportEvent::Closed);
        Ok(())
    }
}

impl InputPort for MidirInputPort {
    fn start(&mut self) -> TransportResult<()> {
        if self.connection.is_none() {
            return Err(not_connected(TransportCall::Start));
        }
        self.shared.active.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> TransportResult<()> {
        self.shared.active.store(false, Ordering::Release);
        Ok(())
    }
}

#[allow(missing_debug_implementations)]
struct MidirOutputPort {
    connection: Option<MidiOutputConnection>,
    events: EventSender,
}

impl MidirOutputPort {
    fn send(&mut self, call: TransportCall, bytes: &[u8]) -> TransportResult<()> {
        let connection = self.connection.as_mut().ok_or_else(|| not_connected(call))?;
        connection
            .send(bytes)
            .map_err(|err| transport_error(call, err))
    }
}

impl LongBufferPort for MidirOutputPort {
    fn submit_long(
        &mut self,
        token: CorrelationToken,
        buf: Vec<u8>,
        len: usize,
    ) -> Result<(), SubmitError> {
        let len = len.min(buf.len());
        if let Err(err) = self.send(TransportCall::SubmitLong, &buf[..len]) {
            return Err(SubmitError { err, buf });
        }
        self.events
            .send(TransportEvent::LongDataCompleted { token, buf, len });
        Ok(())
    }

    fn reset(&mut self) -> TransportResult<()> {
        for channel in 0..16 {
            self.send(TransportCall::Reset, &[0xb0 | channel, ALL_NOTES_OFF, 0x00])?;
        }
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        let Some(connection) = self.connection.take() else {
            return Err(not_connected(TransportCall::Close));
        };
        let _output = connection.close();
        self.events.send(TransportEvent::Closed);
        Ok(())
    }
}

impl OutputPort for MidirOutputPort {
    fn send_short(&mut self, packed: u32) -> TransportResult<()> {
        match ShortMessage::from_packed(packed) {
            Some(message) => self.send(TransportCall::SendShort, message.as_bytes()),
            None => self.send(TransportCall::SendShort, &packed.to_le_bytes()[..1]),
        }
    }
}

/// Connects MIDI ports through [`midir`].
#[derive(Debug, Clone)]
pub struct MidirTransport {
    client_name: String,
}

impl MidirTransport {
    #[must_use]
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }

    fn new_input(&self) -> TransportResult<MidiInput> {
        let mut input = MidiInput::new(&self.client_name)
            .map_err(|err| transport_error(TransportCall::Open, err))?;
        input.ignore(Ignore::None);
        Ok(input)
    }

    fn new_output(&self) -> TransportResult<MidiOutput> {
        MidiOutput::new(&self.client_name).map_err(|err| transport_error(TransportCall::Open, err))
    }
}

impl Transport for MidirTransport {
    fn open_input(
        &self,
        device: &DeviceSelector,
        events: EventSender,
    ) -> Result<BoxedInputPort, OpenError> {
        let input = self.new_input()?;
        let port = select_port(input.ports(), |port| input.port_name(port).ok(), device)?;
        let port_name = input.port_name(&port).unwrap_or_default();
        let shared = Arc::new(InputShared::default());
        let handler = InputHandler {
            shared: Arc::clone(&shared),
            events: events.clone(),
        };
        let connection = input
            .connect(
                &port,
                &self.client_name,
                |micros, input, handler| {
                    handle_input(micros, input, handler);
                },
                handler,
            )
            .map_err(|err| connect_error(&err))?;
        log::debug!("Connected input port \"{port_name}\"");
        events.send(TransportEvent::Opened);
        Ok(Box::new(MidirInputPort {
            connection: Some(connection),
            shared,
            events,
        }))
    }

    fn open_output(
        &self,
        device: &DeviceSelector,
        events: EventSender,
    ) -> Result<BoxedOutputPort, OpenError> {
        let output = self.new_output()?;
        let port = select_port(output.ports(), |port| output.port_name(port).ok(), device)?;
        let port_name = output.port_name(&port).unwrap_or_default();
        let connection = output
            .connect(&port, &self.client_name)
            .map_err(|err| connect_error(&err))?;
        log::debug!("Connected output port \"{port_name}\"");
        events.send(TransportEvent::Opened);
        Ok(Box::new(MidirOutputPort {
            connection: Some(connection),
            events,
        }))
    }

    fn input_device_names(&self) -> Vec<String> {
        match self.new_input() {
            Ok(input) => input
                .ports()
                .iter()
                .filter_map(|port| input.port_name(port).ok())
                .collect(),
            Err(err) => {
                log::warn!("Failed to enumerate input ports: {err}");
                Vec::new()
            }
        }
    }

    fn output_device_names(&self) -> Vec<String> {
        match self.new_output() {
            Ok(output) => output
                .ports()
                .iter()
                .filter_map(|port| output.port_name(port).ok())
                .collect(),
            Err(err) => {
                log::warn!("Failed to enumerate output ports: {err}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_ports_by_name() {
        let ports = vec!["Keyboard", "Synth"];
        let port_name = |port: &&str| Some((*port).to_owned());
        assert_eq!(
            "Keyboard",
            select_port(ports.clone(), port_name, &DeviceSelector::Default).unwrap()
        );
        assert_eq!(
            "Synth",
            select_port(
                ports.clone(),
                port_name,
                &DeviceSelector::Named("Synth".to_owned())
            )
            .unwrap()
        );
        assert!(matches!(
            select_port(ports, port_name, &DeviceSelector::Named("Pad".to_owned())),
            Err(OpenError::NotFound)
        ));
        assert!(matches!(
            select_port(Vec::<&str>::new(), port_name, &DeviceSelector::Default),
            Err(OpenError::NotFound)
        ));
    }
}
