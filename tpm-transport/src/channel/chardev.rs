// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Linux TPM character device backend (/dev/tpmrm0 or /dev/tpm0)

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{BackendKind, CancelFlag, Connector, TpmBackend};
use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::trim_to_param_size;
use crate::types::Command;

/// How often a blocked read wakes up to look at the cancel flag
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Opens a TPM character device, probing the default paths when none is set.
#[derive(Debug, Clone, Default)]
pub struct CharDeviceConnector {
    path: Option<PathBuf>,
}

impl CharDeviceConnector {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    fn resolve(&self) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        DEFAULT_DEVICE_PATHS
            .iter()
            .map(Path::new)
            .find(|p| p.exists())
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                Error::DeviceUnavailable(format!(
                    "TPM device not found (tried {})",
                    DEFAULT_DEVICE_PATHS.join(", ")
                ))
            })
    }
}

impl Connector for CharDeviceConnector {
    fn connect(&self) -> Result<Box<dyn TpmBackend>> {
        let path = self.resolve()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                Error::unavailable(&format!("failed to open {}", path.display()), err)
            })?;
        debug!("opened TPM device {}", path.display());
        Ok(Box::new(CharDevice { file, path }))
    }

    fn describe(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => "auto-detected TPM device".into(),
        }
    }

    fn allows_concurrent_connections(&self) -> bool {
        self.resolve().is_ok_and(|path| is_resource_manager(&path))
    }
}

fn is_resource_manager(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("tpmrm"))
}

/// sysfs attribute that aborts the command in flight on `path`
fn cancel_attribute(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    // tpmrmN is a view on tpmN; the cancel attribute lives on the latter.
    let index = name
        .strip_prefix("tpmrm")
        .or_else(|| name.strip_prefix("tpm"))?;
    Some(PathBuf::from(format!("/sys/class/tpm/tpm{index}/device/cancel")))
}

struct CharDevice {
    file: File,
    path: PathBuf,
}

impl CharDevice {
    /// Wait until the response is readable, the deadline passes, or the
    /// cancel flag is raised (which is forwarded to the driver once).
    fn wait_readable(&self, timeout: Duration, cancel: &CancelFlag) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut cancel_sent = false;
        loop {
            if cancel.is_raised() && !cancel_sent {
                self.send_cancel();
                cancel_sent = true;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "no response from {} within {timeout:?}",
                    self.path.display()
                );
                return Err(Error::TransportTimeout);
            }
            let slice = (deadline - now).min(POLL_SLICE);

            let mut fds = libc::pollfd {
                fd: self.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: `fds` is a single valid pollfd that outlives the call.
            let rc = unsafe { libc::poll(&mut fds, 1, slice.as_millis() as libc::c_int) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::io("poll on TPM device", err));
            }
            if rc > 0 {
                if fds.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                    return Err(Error::TransportError(format!(
                        "TPM device {} reported an error condition",
                        self.path.display()
                    )));
                }
                return Ok(());
            }
        }
    }

    fn send_cancel(&self) {
        let Some(attr) = cancel_attribute(&self.path) else {
            return;
        };
        match fs_err::write(&attr, b"1") {
            Ok(()) => debug!("sent cancel to {}", attr.display()),
            Err(err) => warn!("failed to cancel TPM command: {err}"),
        }
    }
}

impl TpmBackend for CharDevice {
    fn kind(&self) -> BackendKind {
        BackendKind::CharDevice
    }

    fn transmit(
        &mut self,
        command: &Command,
        max_response_len: usize,
        timeout: Duration,
        cancel: &CancelFlag,
    ) -> Result<Vec<u8>> {
        self.file
            .write_all(&command.payload)
            .map_err(|err| Error::io("failed to write TPM command", err))?;

        self.wait_readable(timeout, cancel)?;

        // The driver hands back the whole response in one read and drops
        // whatever does not fit, so read into a full-size buffer and let
        // the header decide.
        let mut response = vec![0u8; max_response_len.max(DEFAULT_MAX_BUFFER_SIZE)];
        let n = self
            .file
            .read(&mut response)
            .map_err(|err| Error::io("failed to read TPM response", err))?;
        response.truncate(n);

        trim_to_param_size(response, max_response_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_manager_detection() {
        assert!(is_resource_manager(Path::new("/dev/tpmrm0")));
        assert!(!is_resource_manager(Path::new("/dev/tpm0")));
    }

    #[test]
    fn test_cancel_attribute_path() {
        assert_eq!(
            cancel_attribute(Path::new("/dev/tpmrm1")),
            Some(PathBuf::from("/sys/class/tpm/tpm1/device/cancel"))
        );
        assert_eq!(
            cancel_attribute(Path::new("/dev/tpm0")),
            Some(PathBuf::from("/sys/class/tpm/tpm0/device/cancel"))
        );
    }

    #[test]
    fn test_missing_device_is_unavailable() {
        let connector = CharDeviceConnector::new(Some("/nonexistent/tpm-dev".into()));
        assert!(matches!(
            connector.connect().map(|_| ()),
            Err(Error::DeviceUnavailable(_))
        ));
    }
}
