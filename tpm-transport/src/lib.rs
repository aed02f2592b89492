// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM command transport and session manager
//!
//! Carries opaque, already-marshaled TPM command buffers to a TPM and brings
//! the response bytes back. The crate does not build or interpret TPM
//! commands beyond the 10-byte header; it owns the plumbing around them:
//!
//! - **Device channel**: one exclusive connection to the TPM, either a Linux
//!   character device (`/dev/tpmrm0` or `/dev/tpm0`) or the TCP protocol of
//!   the Microsoft reference simulator.
//! - **Sessions**: open/close lifecycle over the device handle, with a sticky
//!   last-result code per session.
//! - **Dispatch**: size and locality checks, FIFO serialization of
//!   concurrent submits, per-transmit timeout and best-effort cancellation.
//! - **Queries**: driver/device status and TDDL-style capabilities, without
//!   touching session state.
//!
//! ## Example
//!
//! ```no_run
//! use tpm_transport::{Locality, Priority, TpmTransport, TransportConfig};
//!
//! let transport = TpmTransport::new(&TransportConfig::default())?;
//! let session = transport.create_session()?;
//! // TPM2_GetRandom(8)
//! let command = [0x80, 0x01, 0, 0, 0, 0x0c, 0, 0, 0x01, 0x7b, 0, 8];
//! let response = transport.submit_command(session, &command, Locality::Zero, Priority::Normal)?;
//! transport.close_session(session)?;
//! # Ok::<(), tpm_transport::Error>(())
//! ```

pub mod channel;
pub mod config;
mod constants;
mod device;
mod dispatcher;
mod error;
mod marshal;
mod query;
mod session;
mod sync;
mod transport;
mod types;

pub use channel::{BackendKind, CancelFlag, ChannelState, Connector, TpmBackend};
pub use config::{BackendConfig, DeviceConfig, SimulatorConfig, TransportConfig};
pub use constants::*;
pub use error::{Error, Result, StatusCode};
pub use marshal::{trim_to_param_size, CommandBuffer, Header, ResponseBuffer};
pub use transport::TpmTransport;
pub use types::*;
