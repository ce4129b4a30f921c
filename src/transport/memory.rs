// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

//! Transport without physical devices
//!
//! Behaves like a driver: Submitted buffers are owned by the transport
//! until they are returned through the event queue, reset returns all
//! pending buffers and exclusive devices are reported as busy while open.
//! The test hooks on [`MemoryTransport`] play the role of the device.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;

use super::{
    BoxedInputPort, BoxedOutputPort, DeviceSelector, EventSender, InputPort, LongBufferPort,
    OpenError, OutputPort, SubmitError, Transport, TransportCall, TransportError, TransportEvent,
    TransportResult,
};
use crate::{CorrelationToken, ShortMessage};

const INVALID_HANDLE: u32 = 5;

const INJECTED_FAILURE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

#[derive(Debug)]
struct Device {
    name: String,
    busy: bool,
    session: Option<u64>,
    events: Option<EventSender>,
    started: bool,
    armed: VecDeque<(CorrelationToken, Vec<u8>)>,
    pending: VecDeque<(CorrelationToken, Vec<u8>, usize)>,
    sent: Vec<Vec<u8>>,
}

impl Device {
    fn new(name: String) -> Self {
        Self {
            name,
            busy: false,
            session: None,
            events: None,
            started: false,
            armed: VecDeque::new(),
            pending: VecDeque::new(),
            sent: Vec::new(),
        }
    }

    fn return_all_buffers(&mut self) -> Vec<TransportEvent> {
        let armed = self
            .armed
            .drain(..)
            .map(|(token, buf)| TransportEvent::LongDataCompleted { token, buf, len: 0 });
        let pending = self
            .pending
            .drain(..)
            .map(|(token, buf, _)| TransportEvent::LongDataCompleted { token, buf, len: 0 });
        armed.chain(pending).collect()
    }
}

#[derive(Debug, Default)]
struct State {
    inputs: Vec<Device>,
    outputs: Vec<Device>,
    next_session: u64,
    hold_output: bool,
    stall_on_reset: bool,
    failing_call: Option<TransportCall>,
}

impl State {
    fn devices(&self, direction: Direction) -> &[Device] {
        match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        }
    }

    fn devices_mut(&mut self, direction: Direction) -> &mut Vec<Device> {
        match direction {
            Direction::Input => &mut self.inputs,
            Direction::Output => &mut self.outputs,
        }
    }

    fn device_mut(&mut self, direction: Direction, name: &str) -> Option<&mut Device> {
        self.devices_mut(direction)
            .iter_mut()
            .find(|device| device.name == name)
    }

    fn take_failure(&mut self, call: TransportCall) -> TransportResult<()> {
        if self.failing_call != Some(call) {
            return Ok(());
        }
        self.failing_call = None;
        Err(TransportError::new(call, INJECTED_FAILURE, "injected failure"))
    }
}

fn deliver(events: Option<EventSender>, batch: Vec<TransportEvent>) {
    let Some(events) = events else {
        return;
    };
    for event in batch {
        events.send(event);
    }
}

/// In-memory devices with test hooks.
///
/// Cloning is cheap, all clones share the same devices.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an input device.
    ///
    /// The first input device is the default input device.
    #[must_use]
    pub fn with_input(self, name: impl Into<String>) -> Self {
        self.state.lock().inputs.push(Device::new(name.into()));
        self
    }

    /// Add an output device.
    ///
    /// The first output device is the default output device.
    #[must_use]
    pub fn with_output(self, name: impl Into<String>) -> Self {
        self.state.lock().outputs.push(Device::new(name.into()));
        self
    }

    /// Mark all devices with the given name as occupied by
    /// another application.
    pub fn set_busy(&self, name: &str, busy: bool) {
        let state = &mut *self.state.lock();
        for device in state.inputs.iter_mut().chain(state.outputs.iter_mut()) {
            if device.name == name {
                device.busy = busy;
            }
        }
    }

    /// Keep submitted output buffers pending instead of completing
    /// them immediately.
    pub fn set_hold_output(&self, hold_output: bool) {
        self.state.lock().hold_output = hold_output;
    }

    /// Keep all submitted buffers when reset, i.e. never return them.
    pub fn set_stall_on_reset(&self, stall_on_reset: bool) {
        self.state.lock().stall_on_reset = stall_on_reset;
    }

    /// Let the next invocation of the given call fail.
    pub fn fail_next(&self, call: TransportCall) {
        self.state.lock().failing_call = Some(call);
    }

    #[must_use]
    pub fn is_input_open(&self, name: &str) -> bool {
        self.state
            .lock()
            .device_mut(Direction::Input, name)
            .is_some_and(|device| device.session.is_some())
    }

    #[must_use]
    pub fn is_output_open(&self, name: &str) -> bool {
        self.state
            .lock()
            .device_mut(Direction::Output, name)
            .is_some_and(|device| device.session.is_some())
    }

    /// Number of buffers that are armed for receiving SYSX data.
    #[must_use]
    pub fn armed_input_buffers(&self, name: &str) -> usize {
        self.state
            .lock()
            .device_mut(Direction::Input, name)
            .map_or(0, |device| device.armed.len())
    }

    /// Receive a short message on a started input.
    ///
    /// Returns `false` if the message has not been delivered.
    pub fn inject_short(&self, name: &str, packed: u32) -> bool {
        let events = {
            let mut state = self.state.lock();
            let Some(device) = state.device_mut(Direction::Input, name) else {
                return false;
            };
            if !device.started {
                return false;
            }
            device.events.clone()
        };
        events.is_some_and(|events| events.send_short(packed))
    }

    /// Receive SYSX data on a started input.
    ///
    /// The data is recorded into the armed buffers in the order of their
    /// submission, using as many buffers as needed. Returns `false` if
    /// not all bytes could be recorded.
    pub fn inject_sysx(&self, name: &str, bytes: &[u8]) -> bool {
        let mut rest = bytes;
        let (events, batch) = {
            let mut state = self.state.lock();
            let Some(device) = state.device_mut(Direction::Input, name) else {
                return false;
            };
            if !device.started {
                return false;
            }
            let mut batch = Vec::new();
            while !rest.is_empty() {
                let Some((token, mut buf)) = device.armed.pop_front() else {
                    log::debug!("No buffer armed for {len} byte(s) of SYSX data", len = rest.len());
                    break;
                };
                let len = rest.len().min(buf.len());
                buf[..len].copy_from_slice(&rest[..len]);
                rest = &rest[len..];
                batch.push(TransportEvent::LongDataCompleted { token, buf, len });
            }
            (device.events.clone(), batch)
        };
        deliver(events, batch);
        rest.is_empty()
    }

    /// Report an asynchronous error of an open input.
    pub fn inject_error(&self, name: &str, code: u32) -> bool {
        let events = self
            .state
            .lock()
            .device_mut(Direction::Input, name)
            .and_then(|device| device.events.clone());
        events.is_some_and(|events| events.send(TransportEvent::Error { code }))
    }

    /// All messages that have been sent on an output, in order.
    #[must_use]
    pub fn sent_messages(&self, name: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .device_mut(Direction::Output, name)
            .map(|device| device.sent.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn pending_output_buffers(&self, name: &str) -> usize {
        self.state
            .lock()
            .device_mut(Direction::Output, name)
            .map_or(0, |device| device.pending.len())
    }

    /// Send all held output buffers and return them.
    ///
    /// Returns the number of completed buffers.
    pub fn complete_pending_output(&self, name: &str) -> usize {
        let (events, batch) = {
            let mut state = self.state.lock();
            let Some(device) = state.device_mut(Direction::Output, name) else {
                return 0;
            };
            let mut batch = Vec::with_capacity(device.pending.len());
            while let Some((token, buf, len)) = device.pending.pop_front() {
                device.sent.push(buf[..len].to_vec());
                batch.push(TransportEvent::LongDataCompleted { token, buf, len });
            }
            (device.events.clone(), batch)
        };
        let count = batch.len();
        deliver(events, batch);
        count
    }

    fn open(
        &self,
        direction: Direction,
        selector: &DeviceSelector,
        events: EventSender,
    ) -> Result<MemoryPort, OpenError> {
        let mut state = self.state.lock();
        state.take_failure(TransportCall::Open)?;
        let index = match selector {
            DeviceSelector::Disabled => None,
            DeviceSelector::Default => (!state.devices(direction).is_empty()).then_some(0),
            DeviceSelector::Named(name) => state
                .devices(direction)
                .iter()
                .position(|device| device.name == *name),
        }
        .ok_or(OpenError::NotFound)?;
        let session = state.next_session;
        let device = &mut state.devices_mut(direction)[index];
        if device.busy || device.session.is_some() {
            return Err(OpenError::Busy);
        }
        log::debug!("Opening {direction:?} device \"{name}\"", name = device.name);
        device.session = Some(session);
        device.events = Some(events.clone());
        device.started = false;
        state.next_session += 1;
        drop(state);
        events.send(TransportEvent::Opened);
        Ok(MemoryPort {
            state: Arc::clone(&self.state),
            direction,
            index,
            session,
        })
    }
}

impl Transport for MemoryTransport {
    fn open_input(
        &self,
        device: &DeviceSelector,
        events: EventSender,
    ) -> Result<BoxedInputPort, OpenError> {
        let port = self.open(Direction::Input, device, events)?;
        Ok(Box::new(port))
    }

    fn open_output(
        &self,
        device: &DeviceSelector,
        events: EventSender,
    ) -> Result<BoxedOutputPort, OpenError> {
        let port = self.open(Direction::Output, device, events)?;
        Ok(Box::new(port))
    }

    fn input_device_names(&self) -> Vec<String> {
        let state = self.state.lock();
        state.inputs.iter().map(|device| device.name.clone()).collect()
    }

    fn output_device_names(&self) -> Vec<String> {
        let state = self.state.lock();
        state.outputs.iter().map(|device| device.name.clone()).collect()
    }
}

#[derive(Debug)]
struct MemoryPort {
    state: Arc<Mutex<State>>,
    direction: Direction,
    index: usize,
    session: u64,
}

impl MemoryPort {
    fn with_device<T>(
        &self,
        call: TransportCall,
        f: impl FnOnce(&mut Device, &State) -> T,
    ) -> TransportResult<T> {
        let mut state = self.state.lock();
        state.take_failure(call)?;
        let direction = self.direction;
        let mut devices = std::mem::take(state.devices_mut(direction));
        let result = match devices.get_mut(self.index) {
            Some(device) if device.session == Some(self.session) => Ok(f(device, &state)),
            _ => Err(TransportError::new(call, INVALID_HANDLE, "invalid handle")),
        };
        *state.devices_mut(direction) = devices;
        result
    }
}

impl LongBufferPort for MemoryPort {
    fn submit_long(
        &mut self,
        token: CorrelationToken,
        buf: Vec<u8>,
        len: usize,
    ) -> Result<(), SubmitError> {
        let direction = self.direction;
        let mut returned = None;
        let mut rejected = Some(buf);
        let result = self.with_device(TransportCall::SubmitLong, |device, state| {
            let Some(buf) = rejected.take() else {
                return;
            };
            if direction == Direction::Input {
                device.armed.push_back((token, buf));
            } else if state.hold_output {
                device.pending.push_back((token, buf, len));
            } else {
                let len = len.min(buf.len());
                device.sent.push(buf[..len].to_vec());
                returned = Some((
                    device.events.clone(),
                    TransportEvent::LongDataCompleted { token, buf, len },
                ));
            }
        });
        match result {
            Ok(()) => {
                if let Some((events, event)) = returned {
                    deliver(events, vec![event]);
                }
                Ok(())
            }
            Err(err) => Err(SubmitError {
                err,
                buf: rejected.unwrap_or_default(),
            }),
        }
    }

    fn reset(&mut self) -> TransportResult<()> {
        let (events, batch) = self.with_device(TransportCall::Reset, |device, state| {
            device.started = false;
            if state.stall_on_reset {
                log::debug!("Stalling reset of device \"{name}\"", name = device.name);
                return (None, Vec::new());
            }
            (device.events.clone(), device.return_all_buffers())
        })?;
        deliver(events, batch);
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        let events = self.with_device(TransportCall::Close, |device, _| {
            log::debug!("Closing device \"{name}\"", name = device.name);
            device.session = None;
            device.started = false;
            // Buffers that have not been returned stay with the driver
            device.armed.clear();
            device.pending.clear();
            device.events.take()
        })?;
        deliver(events, vec![TransportEvent::Closed]);
        Ok(())
    }
}

impl InputPort for MemoryPort {
    fn start(&mut self) -> TransportResult<()> {
        self.with_device(TransportCall::Start, |device, _| {
            device.started = true;
        })
    }

    fn stop(&mut self) -> TransportResult<()> {
        self.with_device(TransportCall::Stop, |device, _| {
            device.started = false;
        })
    }
}

impl OutputPort for MemoryPort {
    fn send_short(&mut self, packed: u32) -> TransportResult<()> {
        self.with_device(TransportCall::SendShort, |device, _| {
            let bytes = ShortMessage::from_packed(packed).map_or_else(
                || packed.to_le_bytes()[..1].to_vec(),
                |message| message.as_bytes().to_vec(),
            );
            log::trace!("Sending short message {bytes:02x?}");
            device.sent.push(bytes);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::event_queue;

    fn transport() -> MemoryTransport {
        MemoryTransport::new()
            .with_input("In A")
            .with_input("In B")
            .with_output("Out A")
    }

    #[test]
    fn select_devices() {
        let transport = transport();
        assert_eq!(vec!["In A", "In B"], transport.input_device_names());
        let (events, _receiver) = event_queue(8);
        let _port = transport
            .open_input(&DeviceSelector::Default, events.clone())
            .unwrap();
        assert!(transport.is_input_open("In A"));
        assert!(!transport.is_input_open("In B"));
        assert!(matches!(
            transport.open_input(&DeviceSelector::Named("In C".to_owned()), events.clone()),
            Err(OpenError::NotFound)
        ));
        assert!(matches!(
            transport.open_input(&DeviceSelector::Disabled, events),
            Err(OpenError::NotFound)
        ));
    }

    #[test]
    fn open_devices_are_busy() {
        let transport = transport();
        let (events, _receiver) = event_queue(8);
        let mut port = transport
            .open_input(&DeviceSelector::from_name("In B"), events.clone())
            .unwrap();
        assert!(matches!(
            transport.open_input(&DeviceSelector::from_name("In B"), events.clone()),
            Err(OpenError::Busy)
        ));
        port.close().unwrap();
        let _port = transport
            .open_input(&DeviceSelector::from_name("In B"), events.clone())
            .unwrap();

        transport.set_busy("Out A", true);
        assert!(matches!(
            transport.open_output(&DeviceSelector::Default, events),
            Err(OpenError::Busy)
        ));
    }

    #[test]
    fn closed_port_handle_is_invalid() {
        let transport = transport();
        let (events, _receiver) = event_queue(8);
        let mut port = transport
            .open_input(&DeviceSelector::Default, events)
            .unwrap();
        port.close().unwrap();
        let err = port.start().unwrap_err();
        assert_eq!(TransportCall::Start, err.call);
        assert_eq!(INVALID_HANDLE, err.code);
    }

    #[test]
    fn reset_returns_armed_buffers() {
        let transport = transport();
        let (events, receiver) = event_queue(8);
        let mut port = transport
            .open_input(&DeviceSelector::Default, events)
            .unwrap();
        assert!(matches!(receiver.try_recv(), Some(TransportEvent::Opened)));
        let token = CorrelationToken::from_bits(0x1_0000);
        port.submit_long(token, vec![0; 16], 0).unwrap();
        port.start().unwrap();
        assert_eq!(1, transport.armed_input_buffers("In A"));
        port.reset().unwrap();
        assert_eq!(0, transport.armed_input_buffers("In A"));
        assert!(matches!(
            receiver.try_recv(),
            Some(TransportEvent::LongDataCompleted { token: returned, len: 0, .. }) if returned == token
        ));
        assert!(!transport.inject_short("In A", 0x0064_3c90));
    }

    #[test]
    fn failed_submission_returns_buffer() {
        let transport = transport();
        let (events, _receiver) = event_queue(8);
        let mut port = transport
            .open_output(&DeviceSelector::Default, events)
            .unwrap();
        transport.fail_next(TransportCall::SubmitLong);
        let err = port
            .submit_long(CorrelationToken::from_bits(0), vec![0xf0, 0xf7], 2)
            .unwrap_err();
        assert_eq!(TransportCall::SubmitLong, err.err.call);
        assert_eq!(vec![0xf0, 0xf7], err.buf);
        assert!(transport.sent_messages("Out A").is_empty());
    }
}
