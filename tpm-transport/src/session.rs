// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Session lifecycle
//!
//! A session owns the device handle for as long as it is open. Only one
//! session may be open per device; a closed session stays closed, and its id
//! is never reused.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::device::Device;
use crate::error::{Error, Result, StatusCode};
use crate::types::{DeviceHandle, SessionHandle, SessionState};

/// An open (or faulted) session.
#[derive(Debug)]
pub struct Session {
    id: SessionHandle,
    device_handle: DeviceHandle,
    state: Mutex<SessionState>,
    last_result: Mutex<Option<StatusCode>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    fn new(id: SessionHandle, device_handle: DeviceHandle) -> Self {
        Self {
            id,
            device_handle,
            state: Mutex::new(SessionState::Uninitialized),
            last_result: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SessionHandle {
        self.id
    }

    pub fn device_handle(&self) -> DeviceHandle {
        self.device_handle
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Mark the session faulted. Terminal states are left alone.
    pub(crate) fn fault(&self) {
        let mut state = lock(&self.state);
        if !state.is_terminal() {
            warn!("{} faulted", self.id);
            *state = SessionState::Faulted;
        }
    }

    fn set_state(&self, new: SessionState) {
        *lock(&self.state) = new;
    }

    pub fn last_result(&self) -> Option<StatusCode> {
        *lock(&self.last_result)
    }

    pub(crate) fn record(&self, code: StatusCode) {
        *lock(&self.last_result) = Some(code);
    }
}

#[derive(Debug, Default)]
struct Registry {
    // Sessions that are not yet closed; closed ones are dropped.
    live: HashMap<SessionHandle, Arc<Session>>,
    last_issued: u64,
}

impl Registry {
    fn was_issued(&self, id: SessionHandle) -> bool {
        id.0 >= 1 && id.0 <= self.last_issued
    }
}

/// Issues and tracks sessions for one device.
#[derive(Debug, Default)]
pub struct SessionManager {
    registry: Mutex<Registry>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the device and bind a new session to it.
    pub fn create(&self, device: &Device) -> Result<Arc<Session>> {
        // Lock order is device, then registry. The registry is never held
        // while waiting for the device.
        let mut channel = device.lock();
        let mut registry = lock(&self.registry);
        if registry
            .live
            .values()
            .any(|s| s.state() == SessionState::Open)
        {
            return Err(Error::SessionAlreadyOpen);
        }

        let device_handle = channel.open()?;
        registry.last_issued += 1;
        let id = SessionHandle(registry.last_issued);
        let session = Arc::new(Session::new(id, device_handle));
        session.set_state(SessionState::Open);
        registry.live.insert(id, session.clone());
        info!("{id} opened on {device_handle}");
        Ok(session)
    }

    /// Close a session and release its device handle.
    ///
    /// Closing an already closed session is a no-op; an id that was never
    /// issued is `SessionNotOpen`. A command in flight on the session
    /// finishes first and can still be cancelled while the close waits.
    pub fn close(&self, device: &Device, id: SessionHandle) -> Result<()> {
        {
            let registry = lock(&self.registry);
            if !registry.live.contains_key(&id) {
                if registry.was_issued(id) {
                    return Ok(());
                }
                return Err(Error::SessionNotOpen);
            }
        }

        let mut channel = device.lock();
        let removed = lock(&self.registry).live.remove(&id);
        let Some(session) = removed else {
            // Closed by someone else while we waited.
            return Ok(());
        };
        session.set_state(SessionState::Closed);
        let result = channel.close(session.device_handle);
        info!("{id} closed");
        result
    }

    /// Look up a live session.
    pub fn get(&self, id: SessionHandle) -> Result<Arc<Session>> {
        lock(&self.registry)
            .live
            .get(&id)
            .cloned()
            .ok_or(Error::SessionNotOpen)
    }

    pub fn state(&self, id: SessionHandle) -> Result<SessionState> {
        let registry = lock(&self.registry);
        match registry.live.get(&id) {
            Some(session) => Ok(session.state()),
            None if registry.was_issued(id) => Ok(SessionState::Closed),
            None => Err(Error::SessionNotOpen),
        }
    }

    /// Drop the live device handle, closing every session bound to it.
    pub fn reset_channel(&self, device: &Device) -> Result<()> {
        let mut channel = device.lock();
        let mut registry = lock(&self.registry);
        if let Some(handle) = channel.handle() {
            registry.live.retain(|id, session| {
                if session.device_handle != handle {
                    return true;
                }
                warn!("closing {id}: its channel {handle} is being reset");
                session.set_state(SessionState::Closed);
                false
            });
        }
        channel.reset()
    }

    /// Close everything still open. Used when the transport goes away.
    pub fn close_all(&self, device: &Device) {
        let mut channel = device.lock();
        let mut registry = lock(&self.registry);
        for (id, session) in registry.live.drain() {
            warn!("{id} still {:?} at shutdown, closing", session.state());
            session.set_state(SessionState::Closed);
            if let Err(err) = channel.close(session.device_handle) {
                warn!("failed to close {id}: {err}");
            }
        }
    }
}
