// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Device channel: one exclusive connection to one TPM
//!
//! Backends implement [`TpmBackend`] (raw byte exchange) and are opened by a
//! [`Connector`] chosen from configuration. [`DeviceChannel`] wraps whichever
//! backend is live and owns everything the backends have in common: handle
//! issuance, the open/closed/faulted state machine, per-transmit limits and
//! cancellation bookkeeping.

#[cfg(unix)]
pub mod chardev;
pub mod simulator;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::{get_capability_command, parse_tpm_property};
use crate::types::{Command, DeviceHandle, Locality};

/// Raw connection to a TPM.
pub trait TpmBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Localities this backend can put on the wire
    fn supported_localities(&self) -> &[Locality] {
        &[Locality::Zero]
    }

    /// Send one command and wait for its response.
    ///
    /// Fails with `TransportTimeout` once `timeout` elapses. A response longer
    /// than `max_response_len` is `BufferTooSmall`, never truncated.
    /// `cancel` is polled while waiting.
    fn transmit(
        &mut self,
        command: &Command,
        max_response_len: usize,
        timeout: Duration,
        cancel: &CancelFlag,
    ) -> Result<Vec<u8>>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens backends for one device.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn TpmBackend>>;

    fn describe(&self) -> String;

    /// Whether a second connection may be opened while one is live
    /// (e.g. the kernel resource manager at `/dev/tpmrm0`).
    fn allows_concurrent_connections(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendKind {
    Unknown = 0,
    CharDevice = 1,
    Simulator = 2,
    External = 3,
}

impl BackendKind {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BackendKind::CharDevice,
            2 => BackendKind::Simulator,
            3 => BackendKind::External,
            _ => BackendKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Closed = 0,
    Open = 1,
    Faulted = 2,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ChannelState::Open,
            2 => ChannelState::Faulted,
            _ => ChannelState::Closed,
        }
    }
}

/// Channel state and tunables, readable without the device lock.
#[derive(Debug)]
pub struct ChannelShared {
    state: AtomicU8,
    kind: AtomicU8,
    max_response_len: AtomicUsize,
    timeout_ms: AtomicU64,
}

impl ChannelShared {
    pub fn new(max_response_len: usize, timeout: Duration) -> Self {
        Self {
            state: AtomicU8::new(ChannelState::Closed as u8),
            kind: AtomicU8::new(BackendKind::Unknown as u8),
            max_response_len: AtomicUsize::new(max_response_len),
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
        }
    }

    /// Fresh state carrying the same limits
    fn fork(&self) -> Self {
        Self::new(self.max_response_len(), self.timeout())
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Kind of the most recently opened backend
    pub fn kind(&self) -> BackendKind {
        BackendKind::from_u8(self.kind.load(Ordering::SeqCst))
    }

    pub fn max_response_len(&self) -> usize {
        self.max_response_len.load(Ordering::SeqCst)
    }

    pub fn set_max_response_len(&self, len: usize) {
        self.max_response_len.store(len, Ordering::SeqCst);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::SeqCst))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
    }
}

/// Cancellation signal observed by an in-flight transmit
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancels the outstanding transmit of a handle without taking the device
/// lock. Best effort: the device may still complete the command.
///
/// Every transmit gets its own flag, so a cancel aimed at one command can
/// never land on the next one.
#[derive(Debug, Default)]
pub struct Canceller {
    in_flight: Mutex<Option<(DeviceHandle, CancelFlag)>>,
}

impl Canceller {
    pub fn cancel(&self, handle: DeviceHandle) -> Result<()> {
        match &*lock(&self.in_flight) {
            Some((current, flag)) if *current == handle => {
                debug!("cancel requested for outstanding command on {handle}");
                flag.raise();
                Ok(())
            }
            _ => Err(Error::NothingToCancel),
        }
    }

    fn begin(&self, handle: DeviceHandle) -> CancelFlag {
        let flag = CancelFlag::default();
        *lock(&self.in_flight) = Some((handle, flag.clone()));
        flag
    }

    /// Returns whether a cancel was requested during the transmit
    fn finish(&self, flag: &CancelFlag) -> bool {
        lock(&self.in_flight).take();
        flag.is_raised()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The single live connection to a device.
pub struct DeviceChannel {
    connector: Arc<dyn Connector>,
    backend: Option<Box<dyn TpmBackend>>,
    handle: Option<DeviceHandle>,
    next_handle: u64,
    shared: Arc<ChannelShared>,
    canceller: Arc<Canceller>,
}

impl DeviceChannel {
    pub fn new(connector: Arc<dyn Connector>, shared: Arc<ChannelShared>) -> Self {
        Self {
            connector,
            backend: None,
            handle: None,
            next_handle: 0,
            shared,
            canceller: Arc::new(Canceller::default()),
        }
    }

    /// A separate channel carrying the limits of `limits`, for calls that
    /// must not disturb the primary channel.
    pub fn transient(connector: Arc<dyn Connector>, limits: &ChannelShared) -> Self {
        Self::new(connector, Arc::new(limits.fork()))
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    pub fn canceller(&self) -> Arc<Canceller> {
        self.canceller.clone()
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn handle(&self) -> Option<DeviceHandle> {
        self.handle
    }

    pub fn open(&mut self) -> Result<DeviceHandle> {
        if self.handle.is_some() {
            return Err(Error::AlreadyOpen);
        }
        let backend = self.connector.connect()?;
        self.next_handle += 1;
        let handle = DeviceHandle(self.next_handle);
        self.shared.kind.store(backend.kind() as u8, Ordering::SeqCst);
        self.backend = Some(backend);
        self.handle = Some(handle);
        self.shared.set_state(ChannelState::Open);
        info!("opened TPM channel {handle} on {}", self.connector.describe());
        Ok(handle)
    }

    /// Release `handle`. Closing a handle that is no longer live is a no-op.
    pub fn close(&mut self, handle: DeviceHandle) -> Result<()> {
        if self.handle != Some(handle) {
            debug!("ignoring close of stale handle {handle}");
            return Ok(());
        }
        self.release()
    }

    /// Drop whatever handle is live, faulted or not.
    pub fn reset(&mut self) -> Result<()> {
        if self.handle.is_none() {
            return Ok(());
        }
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let handle = self.handle.take();
        let backend = self.backend.take();
        self.shared.set_state(ChannelState::Closed);
        let result = match backend {
            Some(mut backend) => backend.close(),
            None => Ok(()),
        };
        match (&result, handle) {
            (Err(err), Some(handle)) => warn!("error closing TPM channel {handle}: {err}"),
            (Ok(()), Some(handle)) => debug!("closed TPM channel {handle}"),
            _ => {}
        }
        result
    }

    pub fn supports_locality(&self, locality: Locality) -> bool {
        self.backend
            .as_ref()
            .is_some_and(|b| b.supported_localities().contains(&locality))
    }

    /// Send `command` on `handle` and return exactly the bytes the device
    /// produced.
    pub fn transmit(&mut self, handle: DeviceHandle, command: &Command) -> Result<Vec<u8>> {
        self.check_handle(handle)?;
        let cancel = self.canceller.begin(handle);
        let result = self.exchange(command, &cancel);
        if self.canceller.finish(&cancel) {
            debug!(
                "command on {handle} finished after a cancel request (success: {})",
                result.is_ok()
            );
        }
        result
    }

    /// Read one TPM property (TPM2_GetCapability) through this channel
    pub fn tpm_property(&mut self, property: u32) -> Result<Option<u32>> {
        let handle = self.handle.ok_or_else(not_open)?;
        self.check_handle(handle)?;
        let command = Command::new(get_capability_command(tpm_cap::TPM_PROPERTIES, property));
        let response = self.exchange(&command, &CancelFlag::default())?;
        parse_tpm_property(&response, property)
    }

    fn check_handle(&self, handle: DeviceHandle) -> Result<()> {
        match self.shared.state() {
            ChannelState::Faulted => Err(Error::ChannelFaulted),
            ChannelState::Open if self.handle == Some(handle) => Ok(()),
            _ => Err(Error::TransportError(format!(
                "device handle {handle} is not open"
            ))),
        }
    }

    fn exchange(&mut self, command: &Command, cancel: &CancelFlag) -> Result<Vec<u8>> {
        let backend = self.backend.as_mut().ok_or_else(not_open)?;
        let max_response_len = self.shared.max_response_len();
        let timeout = self.shared.timeout();

        let start = Instant::now();
        let result = backend
            .transmit(command, max_response_len, timeout, cancel)
            .and_then(|response| {
                if response.len() > max_response_len {
                    Err(Error::BufferTooSmall)
                } else {
                    Ok(response)
                }
            });
        let elapsed = start.elapsed();

        match &result {
            Ok(response) => debug!(
                "TPM exchange: {} bytes in, {} bytes out, locality {}, {:?} priority, {elapsed:?}",
                command.len(),
                response.len(),
                command.locality,
                command.priority,
            ),
            Err(err) if err.is_fatal() => {
                error!("TPM channel faulted after {elapsed:?}: {err}");
                self.shared.set_state(ChannelState::Faulted);
            }
            Err(err) => debug!("TPM exchange failed after {elapsed:?}: {err}"),
        }
        result
    }
}

impl Drop for DeviceChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.handle {
            warn!("TPM channel {handle} dropped while open, closing");
            let _ = self.release();
        }
    }
}

fn not_open() -> Error {
    Error::TransportError("device channel is not open".into())
}

/// Driver version reported through the version capability area:
/// major, minor, patch, 0.
pub fn driver_version() -> [u8; 4] {
    let part = |s: &str| s.parse::<u8>().unwrap_or(0);
    [
        part(env!("CARGO_PKG_VERSION_MAJOR")),
        part(env!("CARGO_PKG_VERSION_MINOR")),
        part(env!("CARGO_PKG_VERSION_PATCH")),
        0,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Scripted {
        replies: Arc<Mutex<Vec<Result<Vec<u8>>>>>,
    }

    impl TpmBackend for Scripted {
        fn kind(&self) -> BackendKind {
            BackendKind::External
        }

        fn transmit(
            &mut self,
            _command: &Command,
            _max_response_len: usize,
            _timeout: Duration,
            _cancel: &CancelFlag,
        ) -> Result<Vec<u8>> {
            self.replies.lock().unwrap().remove(0)
        }
    }

    struct ScriptedConnector {
        replies: Arc<Mutex<Vec<Result<Vec<u8>>>>>,
    }

    impl Connector for ScriptedConnector {
        fn connect(&self) -> Result<Box<dyn TpmBackend>> {
            Ok(Box::new(Scripted {
                replies: self.replies.clone(),
            }))
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    fn channel(replies: Vec<Result<Vec<u8>>>) -> DeviceChannel {
        let connector = Arc::new(ScriptedConnector {
            replies: Arc::new(Mutex::new(replies)),
        });
        let shared = Arc::new(ChannelShared::new(
            DEFAULT_MAX_BUFFER_SIZE,
            DEFAULT_TRANSMIT_TIMEOUT,
        ));
        DeviceChannel::new(connector, shared)
    }

    #[test]
    fn test_open_twice_fails() {
        let mut ch = channel(vec![]);
        let handle = ch.open().unwrap();
        assert_eq!(ch.open(), Err(Error::AlreadyOpen));
        ch.close(handle).unwrap();
        assert_eq!(ch.state(), ChannelState::Closed);
        let second = ch.open().unwrap();
        assert_ne!(handle, second);
    }

    #[test]
    fn test_timeout_faults_until_reset() {
        let mut ch = channel(vec![Err(Error::TransportTimeout)]);
        let handle = ch.open().unwrap();
        let cmd = Command::new(vec![0u8; 10]);
        assert_eq!(ch.transmit(handle, &cmd), Err(Error::TransportTimeout));
        assert_eq!(ch.state(), ChannelState::Faulted);
        assert_eq!(ch.transmit(handle, &cmd), Err(Error::ChannelFaulted));
        assert_eq!(ch.open(), Err(Error::AlreadyOpen));
        ch.reset().unwrap();
        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(ch.open().is_ok());
    }

    #[test]
    fn test_oversized_backend_reply_is_rejected() {
        let mut ch = channel(vec![Ok(vec![0u8; 32])]);
        ch.shared().set_max_response_len(16);
        let handle = ch.open().unwrap();
        let cmd = Command::new(vec![0u8; 10]);
        assert_eq!(ch.transmit(handle, &cmd), Err(Error::BufferTooSmall));
        assert_eq!(ch.state(), ChannelState::Open);
    }

    #[test]
    fn test_cancel_without_outstanding_command() {
        let mut ch = channel(vec![]);
        let handle = ch.open().unwrap();
        assert_eq!(ch.canceller().cancel(handle), Err(Error::NothingToCancel));
    }

    #[test]
    fn test_cancel_only_reaches_the_current_transmit() {
        let canceller = Canceller::default();
        let handle = DeviceHandle(1);

        let first = canceller.begin(handle);
        canceller.cancel(handle).unwrap();
        assert!(first.is_raised());
        assert!(canceller.finish(&first));

        assert_eq!(canceller.cancel(handle), Err(Error::NothingToCancel));
        let second = canceller.begin(handle);
        assert!(!second.is_raised());
        assert_eq!(canceller.cancel(DeviceHandle(2)), Err(Error::NothingToCancel));
        assert!(!canceller.finish(&second));
    }
}
