// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command dispatch
//!
//! Submissions are validated up front, then wait their turn on the device
//! lock. Nothing is retried; whatever the channel reports is what the caller
//! gets, and is recorded as the session's last result.

use tracing::trace;

use crate::channel::ChannelState;
use crate::device::Device;
use crate::error::{Error, Result, StatusCode};
use crate::session::Session;
use crate::types::{Command, Response, SessionState};

/// Send one command on `session` and wait for its response.
pub fn submit(device: &Device, session: &Session, command: &Command) -> Result<Response> {
    let result = dispatch(device, session, command);
    session.record(StatusCode::from(&result));
    result.map(Response::new)
}

fn check_session(session: &Session) -> Result<()> {
    match session.state() {
        SessionState::Open => Ok(()),
        SessionState::Faulted => Err(Error::ChannelFaulted),
        SessionState::Uninitialized | SessionState::Closed => Err(Error::SessionNotOpen),
    }
}

fn dispatch(device: &Device, session: &Session, command: &Command) -> Result<Vec<u8>> {
    check_session(session)?;
    let max = device.max_command_size();
    if command.len() > max {
        return Err(Error::CommandTooLarge {
            len: command.len(),
            max,
        });
    }

    trace!(
        "{} waiting for the device ({} ahead)",
        session.id(),
        device.queue_len()
    );
    let mut channel = device.lock();

    // The session may have been closed while this call was queued.
    check_session(session)?;
    if channel.state() == ChannelState::Faulted {
        return Err(Error::ChannelFaulted);
    }
    if !channel.supports_locality(command.locality) {
        return Err(Error::UnsupportedLocality(command.locality));
    }

    let result = channel.transmit(session.device_handle(), command);
    if let Err(err) = &result {
        if err.is_fatal() {
            session.fault();
        }
    }
    result
}

/// Ask the device to abandon the command `session` has in flight.
///
/// Best effort: the command may still complete normally.
pub fn cancel(device: &Device, session: &Session) -> Result<()> {
    let result = match session.state() {
        SessionState::Open | SessionState::Faulted => {
            device.canceller().cancel(session.device_handle())
        }
        SessionState::Uninitialized | SessionState::Closed => Err(Error::SessionNotOpen),
    };
    session.record(StatusCode::from(&result));
    result
}
