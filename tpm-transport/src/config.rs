// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Transport configuration
//!
//! ```toml
//! max_response_size = 4096
//! transmit_timeout_ms = 120000
//!
//! [backend]
//! kind = "simulator"
//! host = "127.0.0.1"
//! command_port = 2321
//! platform_port = 2322
//! power_on = true
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::channel::simulator::SimulatorConnector;
use crate::channel::Connector;
use crate::constants::*;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub backend: BackendConfig,
    /// Largest command payload accepted by submit
    pub max_command_size: usize,
    /// Response buffer offered to the device; renegotiable at runtime
    pub max_response_size: usize,
    pub transmit_timeout_ms: u64,
    /// Serve TPM-backed capability queries over a second connection when the
    /// device permits one, instead of queueing behind commands.
    pub out_of_band_queries: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            max_command_size: DEFAULT_MAX_BUFFER_SIZE,
            max_response_size: DEFAULT_MAX_BUFFER_SIZE,
            transmit_timeout_ms: DEFAULT_TRANSMIT_TIMEOUT.as_millis() as u64,
            out_of_band_queries: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Device(DeviceConfig),
    Simulator(SimulatorConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Device(DeviceConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Character device; probes /dev/tpmrm0 then /dev/tpm0 when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatorConfig {
    pub host: String,
    pub command_port: u16,
    pub platform_port: u16,
    pub power_on: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            host: mssim::DEFAULT_HOST.into(),
            command_port: mssim::DEFAULT_COMMAND_PORT,
            platform_port: mssim::DEFAULT_PLATFORM_PORT,
            power_on: false,
        }
    }
}

impl TransportConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs_err::read_to_string(path).map_err(|err| Error::Config(err.to_string()))?;
        Self::from_toml(&text)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = TPM_HEADER_SIZE..=MAX_NEGOTIABLE_BUFFER_SIZE;
        if !sizes.contains(&self.max_command_size) {
            return Err(Error::Config(format!(
                "max_command_size {} is outside {sizes:?}",
                self.max_command_size
            )));
        }
        if !sizes.contains(&self.max_response_size) {
            return Err(Error::Config(format!(
                "max_response_size {} is outside {sizes:?}",
                self.max_response_size
            )));
        }
        if self.transmit_timeout_ms == 0 || self.transmit_timeout_ms > u32::MAX as u64 {
            return Err(Error::Config(format!(
                "transmit_timeout_ms {} is out of range",
                self.transmit_timeout_ms
            )));
        }
        Ok(())
    }

    /// Connector for the configured backend
    pub fn connector(&self) -> Result<Arc<dyn Connector>> {
        match &self.backend {
            #[cfg(unix)]
            BackendConfig::Device(device) => Ok(Arc::new(
                crate::channel::chardev::CharDeviceConnector::new(device.path.clone()),
            )),
            #[cfg(not(unix))]
            BackendConfig::Device(_) => Err(Error::Config(
                "the character device backend requires a unix target".into(),
            )),
            BackendConfig::Simulator(sim) => Ok(Arc::new(
                SimulatorConnector::new(sim.host.clone(), sim.command_port, sim.platform_port)
                    .with_power_on(sim.power_on),
            )),
        }
    }
}
