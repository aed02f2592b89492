// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Recording mock backend shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tpm_transport::{
    tpm_cap, BackendKind, CancelFlag, Command, CommandBuffer, Connector, Error, Locality, Result,
    TpmBackend, TpmSt, TransportConfig, PARAM_SIZE_OFFSET,
};

/// What the mock does with the next transmit.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Return the command bytes after `MockState::echo_delay`
    Echo,
    Bytes(Vec<u8>),
    Fail(Error),
    /// Block until cancelled (then return a TPM_RC_CANCELED response) or
    /// until the timeout passes.
    WaitForCancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start(Vec<u8>),
    End(Vec<u8>),
}

#[derive(Debug, Default)]
pub struct MockState {
    pub events: Mutex<Vec<Event>>,
    pub replies: Mutex<VecDeque<Reply>>,
    pub echo_delay: Mutex<Duration>,
    pub connects: AtomicUsize,
    pub open_backends: AtomicUsize,
}

impl MockState {
    pub fn push_reply(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn transmit_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Start(_)))
            .count()
    }

    pub fn open_backends(&self) -> usize {
        self.open_backends.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

pub struct MockConnector {
    pub state: Arc<MockState>,
    pub concurrent: bool,
}

impl Connector for MockConnector {
    fn connect(&self) -> Result<Box<dyn TpmBackend>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.open_backends.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockBackend {
            state: self.state.clone(),
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "mock".into()
    }

    fn allows_concurrent_connections(&self) -> bool {
        self.concurrent
    }
}

struct MockBackend {
    state: Arc<MockState>,
    closed: bool,
}

impl MockBackend {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.open_backends.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl TpmBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::External
    }

    fn transmit(
        &mut self,
        command: &Command,
        _max_response_len: usize,
        timeout: Duration,
        cancel: &CancelFlag,
    ) -> Result<Vec<u8>> {
        let payload = command.payload.clone();
        self.state
            .events
            .lock()
            .unwrap()
            .push(Event::Start(payload.clone()));
        let reply = self
            .state
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Echo);

        let result = match reply {
            Reply::Echo => {
                let delay = *self.state.echo_delay.lock().unwrap();
                thread::sleep(delay);
                Ok(payload.clone())
            }
            Reply::Bytes(bytes) => Ok(bytes),
            Reply::Fail(err) => Err(err),
            Reply::WaitForCancel => {
                let deadline = Instant::now() + timeout;
                loop {
                    if cancel.is_raised() {
                        break Ok(response_with_rc(TPM_RC_CANCELED));
                    }
                    if Instant::now() >= deadline {
                        break Err(Error::TransportTimeout);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        };

        self.state.events.lock().unwrap().push(Event::End(payload));
        result
    }

    fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.release();
    }
}

pub const TPM_RC_CANCELED: u32 = 0x0909;

/// A bare response header carrying `rc`
pub fn response_with_rc(rc: u32) -> Vec<u8> {
    let mut buf = CommandBuffer::with_capacity(10);
    buf.put_u16(TpmSt::NoSessions.to_u16());
    buf.put_u32(10);
    buf.put_u32(rc);
    buf.into_vec()
}

/// A successful TPM2_GetCapability response reporting one TPM property
pub fn property_response(property: u32, value: u32) -> Vec<u8> {
    let mut buf = CommandBuffer::with_capacity(27);
    buf.put_u16(TpmSt::NoSessions.to_u16());
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u8(0);
    buf.put_u32(tpm_cap::TPM_PROPERTIES);
    buf.put_u32(1);
    buf.put_u32(property);
    buf.put_u32(value);
    let size = buf.len() as u32;
    buf.update_u32(PARAM_SIZE_OFFSET, size);
    buf.into_vec()
}

/// A bare 10-byte command header
pub fn small_command() -> Vec<u8> {
    vec![0x80, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x01, 0x43]
}

pub fn mock(concurrent: bool) -> (Arc<MockState>, Arc<MockConnector>) {
    let state = Arc::new(MockState::default());
    let connector = Arc::new(MockConnector {
        state: state.clone(),
        concurrent,
    });
    (state, connector)
}

pub fn transport_with(config: &TransportConfig) -> (Arc<MockState>, tpm_transport::TpmTransport) {
    let (state, connector) = mock(false);
    let transport =
        tpm_transport::TpmTransport::with_connector(config, connector).expect("valid config");
    (state, transport)
}

pub fn transport() -> (Arc<MockState>, tpm_transport::TpmTransport) {
    transport_with(&TransportConfig::default())
}

pub fn zero_normal(cmd: &[u8]) -> Command {
    Command::new(cmd).with_locality(Locality::Zero)
}
