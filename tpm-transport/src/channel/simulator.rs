// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Microsoft TPM 2.0 simulator backend (mssim TCP protocol)
//!
//! Commands go to the TPM port framed as
//! `SEND_COMMAND | locality (u8) | length (u32) | bytes`, and come back as
//! `length (u32) | bytes | ack (u32)`. Power and cancel signals go to the
//! platform port, one u32 each, acknowledged with a u32 zero.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{BackendKind, CancelFlag, Connector, TpmBackend};
use crate::constants::*;
use crate::error::{Error, Result, StatusCode};
use crate::types::{Command, Locality};

/// How often a pending response is checked against the cancel flag
const POLL_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SimulatorConnector {
    host: String,
    command_port: u16,
    platform_port: u16,
    power_on: bool,
}

impl Default for SimulatorConnector {
    fn default() -> Self {
        Self {
            host: mssim::DEFAULT_HOST.into(),
            command_port: mssim::DEFAULT_COMMAND_PORT,
            platform_port: mssim::DEFAULT_PLATFORM_PORT,
            power_on: false,
        }
    }
}

impl SimulatorConnector {
    pub fn new(host: impl Into<String>, command_port: u16, platform_port: u16) -> Self {
        Self {
            host: host.into(),
            command_port,
            platform_port,
            power_on: false,
        }
    }

    /// Power the simulated TPM and its NV memory on after connecting
    pub fn with_power_on(mut self, power_on: bool) -> Self {
        self.power_on = power_on;
        self
    }

    fn dial(&self, port: u16) -> Result<TcpStream> {
        let stream = TcpStream::connect((self.host.as_str(), port)).map_err(|err| {
            Error::unavailable(&format!("failed to connect to {}:{port}", self.host), err)
        })?;
        stream
            .set_nodelay(true)
            .map_err(|err| Error::io("failed to configure simulator socket", err))?;
        Ok(stream)
    }
}

impl Connector for SimulatorConnector {
    fn connect(&self) -> Result<Box<dyn TpmBackend>> {
        let tpm = self.dial(self.command_port)?;
        let platform = self.dial(self.platform_port)?;
        let mut sim = Simulator { tpm, platform };
        if self.power_on {
            sim.signal(mssim::SIGNAL_POWER_ON)?;
            sim.signal(mssim::SIGNAL_NV_ON)?;
            debug!("simulator powered on");
        }
        Ok(Box::new(sim))
    }

    fn describe(&self) -> String {
        format!(
            "mssim://{}:{} (platform {})",
            self.host, self.command_port, self.platform_port
        )
    }

    fn allows_concurrent_connections(&self) -> bool {
        // The reference simulator serves one client at a time.
        false
    }
}

struct Simulator {
    tpm: TcpStream,
    platform: TcpStream,
}

fn read_u32(stream: &mut TcpStream) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

impl Simulator {
    fn signal(&mut self, signal: u32) -> Result<()> {
        self.platform
            .write_all(&signal.to_be_bytes())
            .map_err(|err| Error::io("failed to signal simulator platform", err))?;
        let ack = read_u32(&mut self.platform)
            .map_err(|err| Error::io("failed to read platform ack", err))?;
        match Error::from_native(StatusCode(ack)) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Block until response bytes are waiting, forwarding a cancel request
    /// to the platform port the first time it is seen.
    fn wait_readable(&mut self, deadline: Instant, cancel: &CancelFlag) -> Result<bool> {
        let mut cancel_sent = false;
        let mut probe = [0u8; 1];
        loop {
            if cancel.is_raised() && !cancel_sent {
                self.signal(mssim::SIGNAL_CANCEL_ON)?;
                cancel_sent = true;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TransportTimeout);
            }
            let slice = (deadline - now).min(POLL_SLICE);
            self.tpm
                .set_read_timeout(Some(slice))
                .map_err(|err| Error::io("failed to set read timeout", err))?;
            match self.tpm.peek(&mut probe) {
                Ok(0) => {
                    return Err(Error::TransportError(
                        "simulator closed the connection".into(),
                    ))
                }
                Ok(_) => return Ok(cancel_sent),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(err) => return Err(Error::io("failed to read simulator response", err)),
            }
        }
    }

    fn read_response(&mut self, deadline: Instant, max_response_len: usize) -> Result<Vec<u8>> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::TransportTimeout);
        }
        self.tpm
            .set_read_timeout(Some(remaining))
            .map_err(|err| Error::io("failed to set read timeout", err))?;

        let len = read_u32(&mut self.tpm)
            .map_err(|err| Error::io("failed to read response length", err))?
            as usize;
        if len > max_response_len {
            debug!("simulator response of {len} bytes exceeds {max_response_len}");
            self.discard_response(len);
            return Err(Error::BufferTooSmall);
        }
        let mut response = vec![0u8; len];
        self.tpm
            .read_exact(&mut response)
            .map_err(|err| Error::io("failed to read response body", err))?;
        let ack = read_u32(&mut self.tpm)
            .map_err(|err| Error::io("failed to read response ack", err))?;

        if let Some(err) = Error::from_native(StatusCode(ack)) {
            return Err(err);
        }
        Ok(response)
    }

    /// Skip the rest of a response frame whose body is `len` bytes long.
    ///
    /// If the frame cannot be drained the connection is shut down, so the
    /// next exchange fails instead of reading from the middle of a frame.
    fn discard_response(&mut self, len: usize) {
        let body = io::copy(&mut Read::by_ref(&mut self.tpm).take(len as u64), &mut io::sink());
        let drained = match body {
            Ok(n) if n == len as u64 => read_u32(&mut self.tpm).map(|_| ()),
            Ok(n) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("frame ended after {n} of {len} bytes"),
            )),
            Err(err) => Err(err),
        };
        if let Err(err) = drained {
            warn!("failed to discard oversized simulator response: {err}");
            let _ = self.tpm.shutdown(Shutdown::Both);
        }
    }
}

impl TpmBackend for Simulator {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulator
    }

    fn supported_localities(&self) -> &[Locality] {
        &Locality::ALL
    }

    fn transmit(
        &mut self,
        command: &Command,
        max_response_len: usize,
        timeout: Duration,
        cancel: &CancelFlag,
    ) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;

        let mut frame = Vec::with_capacity(9 + command.len());
        frame.extend_from_slice(&mssim::SEND_COMMAND.to_be_bytes());
        frame.push(command.locality.to_u8());
        frame.extend_from_slice(&(command.len() as u32).to_be_bytes());
        frame.extend_from_slice(&command.payload);
        self.tpm
            .write_all(&frame)
            .map_err(|err| Error::io("failed to send command to simulator", err))?;

        let cancel_sent = self.wait_readable(deadline, cancel)?;
        let result = self.read_response(deadline, max_response_len);
        if cancel_sent {
            if let Err(err) = self.signal(mssim::SIGNAL_CANCEL_OFF) {
                warn!("failed to clear simulator cancel: {err}");
            }
        }
        result
    }

    fn close(&mut self) -> Result<()> {
        let end = mssim::SESSION_END.to_be_bytes();
        let tpm = self.tpm.write_all(&end);
        let platform = self.platform.write_all(&end);
        tpm.and(platform)
            .map_err(|err| Error::io("failed to end simulator session", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    /// Minimal mssim server: echoes each command back as its response.
    fn spawn_echo_server() -> (u16, u16, thread::JoinHandle<(u8, Vec<u8>)>) {
        let tpm = TcpListener::bind("127.0.0.1:0").unwrap();
        let platform = TcpListener::bind("127.0.0.1:0").unwrap();
        let tpm_port = tpm.local_addr().unwrap().port();
        let platform_port = platform.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut conn, _) = tpm.accept().unwrap();
            let (_platform_conn, _) = platform.accept().unwrap();
            assert_eq!(read_u32(&mut conn).unwrap(), mssim::SEND_COMMAND);
            let mut locality = [0u8; 1];
            conn.read_exact(&mut locality).unwrap();
            let len = read_u32(&mut conn).unwrap() as usize;
            let mut body = vec![0u8; len];
            conn.read_exact(&mut body).unwrap();

            conn.write_all(&(len as u32).to_be_bytes()).unwrap();
            conn.write_all(&body).unwrap();
            conn.write_all(&0u32.to_be_bytes()).unwrap();
            assert_eq!(read_u32(&mut conn).unwrap(), mssim::SESSION_END);
            (locality[0], body)
        });
        (tpm_port, platform_port, server)
    }

    #[test]
    fn test_command_framing_and_echo() {
        let (tpm_port, platform_port, server) = spawn_echo_server();
        let connector = SimulatorConnector::new("127.0.0.1", tpm_port, platform_port);
        let mut backend = connector.connect().unwrap();

        let command = Command::new(vec![0x80, 0x01, 0, 0, 0, 10, 0, 0, 0x01, 0x44])
            .with_locality(Locality::Three);
        let response = backend
            .transmit(&command, 4096, Duration::from_secs(5), &CancelFlag::default())
            .unwrap();
        assert_eq!(response, command.payload);
        backend.close().unwrap();

        let (locality, body) = server.join().unwrap();
        assert_eq!(locality, 3);
        assert_eq!(body, command.payload);
    }

    #[test]
    fn test_oversized_response_is_buffer_too_small() {
        let (tpm_port, platform_port, server) = spawn_echo_server();
        let connector = SimulatorConnector::new("127.0.0.1", tpm_port, platform_port);
        let mut backend = connector.connect().unwrap();

        let command = Command::new(vec![0xAB; 64]);
        let result = backend.transmit(&command, 16, Duration::from_secs(5), &CancelFlag::default());
        assert_eq!(result, Err(Error::BufferTooSmall));
        backend.close().unwrap();
        server.join().unwrap();
    }

    /// Server that answers the first command with a frame announcing
    /// `announced` bytes but carrying only `sent` of them. With a full frame
    /// it then echoes a second command on the same connection.
    fn spawn_oversized_server(announced: u32, sent: usize) -> (u16, u16, thread::JoinHandle<()>) {
        let tpm = TcpListener::bind("127.0.0.1:0").unwrap();
        let platform = TcpListener::bind("127.0.0.1:0").unwrap();
        let tpm_port = tpm.local_addr().unwrap().port();
        let platform_port = platform.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut conn, _) = tpm.accept().unwrap();
            let (_platform_conn, _) = platform.accept().unwrap();
            let read_command = |conn: &mut TcpStream| {
                assert_eq!(read_u32(conn).unwrap(), mssim::SEND_COMMAND);
                let mut locality = [0u8; 1];
                conn.read_exact(&mut locality).unwrap();
                let len = read_u32(conn).unwrap() as usize;
                let mut body = vec![0u8; len];
                conn.read_exact(&mut body).unwrap();
                body
            };

            read_command(&mut conn);
            conn.write_all(&announced.to_be_bytes()).unwrap();
            conn.write_all(&vec![0x5A; sent]).unwrap();
            if sent < announced as usize {
                return;
            }
            conn.write_all(&0u32.to_be_bytes()).unwrap();

            let body = read_command(&mut conn);
            conn.write_all(&(body.len() as u32).to_be_bytes()).unwrap();
            conn.write_all(&body).unwrap();
            conn.write_all(&0u32.to_be_bytes()).unwrap();
        });
        (tpm_port, platform_port, server)
    }

    #[test]
    fn test_huge_announced_length_is_buffer_too_small() {
        let (tpm_port, platform_port, server) = spawn_oversized_server(0xFFFF_FFF0, 8);
        let connector = SimulatorConnector::new("127.0.0.1", tpm_port, platform_port);
        let mut backend = connector.connect().unwrap();

        let command = Command::new(vec![0x80, 0x01, 0, 0, 0, 10, 0, 0, 0x01, 0x7B]);
        let start = Instant::now();
        let result = backend.transmit(&command, 4096, Duration::from_secs(5), &CancelFlag::default());
        assert_eq!(result, Err(Error::BufferTooSmall));
        assert!(start.elapsed() < Duration::from_secs(5));
        server.join().unwrap();
    }

    #[test]
    fn test_stream_stays_in_sync_after_oversized_response() {
        let (tpm_port, platform_port, server) = spawn_oversized_server(64 * 1024, 64 * 1024);
        let connector = SimulatorConnector::new("127.0.0.1", tpm_port, platform_port);
        let mut backend = connector.connect().unwrap();

        let command = Command::new(vec![0x80, 0x01, 0, 0, 0, 10, 0, 0, 0x01, 0x7B]);
        let result = backend.transmit(&command, 4096, Duration::from_secs(5), &CancelFlag::default());
        assert_eq!(result, Err(Error::BufferTooSmall));

        let response = backend
            .transmit(&command, 4096, Duration::from_secs(5), &CancelFlag::default())
            .unwrap();
        assert_eq!(response, command.payload);
        server.join().unwrap();
    }

    #[test]
    fn test_connect_refused_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let connector = SimulatorConnector::new("127.0.0.1", port, port);
        assert!(matches!(
            connector.connect().map(|_| ()),
            Err(Error::DeviceUnavailable(_))
        ));
    }
}
