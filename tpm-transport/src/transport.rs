// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Caller-facing transport API

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::channel::Connector;
use crate::config::TransportConfig;
use crate::device::Device;
use crate::dispatcher;
use crate::error::{Error, Result, StatusCode};
use crate::query;
use crate::session::SessionManager;
use crate::types::{
    Command, Locality, Priority, Response, SessionHandle, SessionState, StatusType, StatusValue,
};

/// Session-oriented access to one TPM.
///
/// Every operation records its outcome as the transport's last result code,
/// readable with [`last_result_code`](Self::last_result_code). Submissions
/// additionally record it on the session they ran on.
pub struct TpmTransport {
    device: Device,
    sessions: SessionManager,
    last_result: Mutex<Option<StatusCode>>,
}

impl TpmTransport {
    /// Build a transport for the backend named in `config`.
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let connector = config.connector()?;
        Self::with_connector(config, connector)
    }

    /// Build a transport over a caller-supplied backend.
    pub fn with_connector(config: &TransportConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        debug!("TPM transport on {}", connector.describe());
        Ok(Self {
            device: Device::new(connector, config),
            sessions: SessionManager::new(),
            last_result: Mutex::new(None),
        })
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        let code = StatusCode::from(&result);
        *self
            .last_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(code);
        result
    }

    /// Open the device and start a session on it.
    pub fn create_session(&self) -> Result<SessionHandle> {
        let result = self.sessions.create(&self.device).map(|s| s.id());
        self.record(result)
    }

    pub fn close_session(&self, session: SessionHandle) -> Result<()> {
        let result = self.sessions.close(&self.device, session);
        self.record(result)
    }

    pub fn session_state(&self, session: SessionHandle) -> Result<SessionState> {
        self.sessions.state(session)
    }

    /// Last result recorded on `session`.
    pub fn session_last_result(&self, session: SessionHandle) -> Result<Option<StatusCode>> {
        self.sessions.get(session).map(|s| s.last_result())
    }

    /// Send raw command bytes and return the raw response bytes.
    pub fn submit_command(
        &self,
        session: SessionHandle,
        payload: &[u8],
        locality: Locality,
        priority: Priority,
    ) -> Result<Vec<u8>> {
        let command = Command::new(payload)
            .with_locality(locality)
            .with_priority(priority);
        self.submit(session, &command).map(Response::into_payload)
    }

    pub fn submit(&self, session: SessionHandle, command: &Command) -> Result<Response> {
        let result = self
            .sessions
            .get(session)
            .and_then(|s| dispatcher::submit(&self.device, &s, command));
        self.record(result)
    }

    /// Best-effort cancel of the command `session` has in flight.
    pub fn cancel_outstanding(&self, session: SessionHandle) -> Result<()> {
        let result = self
            .sessions
            .get(session)
            .and_then(|s| dispatcher::cancel(&self.device, &s));
        self.record(result)
    }

    pub fn query_capability(&self, area: u32, sub_cap: u32) -> Result<Vec<u8>> {
        self.record(query::get_capability(&self.device, area, sub_cap))
    }

    pub fn set_capability(&self, area: u32, sub_cap: u32, value: &[u8]) -> Result<()> {
        self.record(query::set_capability(&self.device, area, sub_cap, value))
    }

    pub fn get_status(&self, status_type: StatusType) -> StatusValue {
        let value = query::get_status(&self.device, status_type);
        let _ = self.record(Ok(()));
        value
    }

    /// Discard the device handle, closing any session bound to it, so the
    /// next `create_session` reopens the device.
    pub fn reset_channel(&self) -> Result<()> {
        let result = self.sessions.reset_channel(&self.device);
        self.record(result)
    }

    /// Physical presence commands are not supported by any backend.
    pub fn physical_presence(&self, _command: &[u8]) -> Result<Vec<u8>> {
        self.record(Err(Error::NotImplemented("physical presence command")))
    }

    pub fn last_result_code(&self) -> Option<StatusCode> {
        *self
            .last_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Read and clear the last result code.
    pub fn take_last_result_code(&self) -> Option<StatusCode> {
        self.last_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for TpmTransport {
    fn drop(&mut self) {
        self.sessions.close_all(&self.device);
    }
}
