// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! One TPM device: its channel behind a FIFO lock, plus the lock-free state
//! shared with status queries and cancellation.

use std::sync::Arc;
use std::time::Duration;

use crate::channel::{Canceller, ChannelShared, Connector, DeviceChannel};
use crate::config::TransportConfig;
use crate::sync::{FairMutex, FairMutexGuard};

pub struct Device {
    channel: FairMutex<DeviceChannel>,
    connector: Arc<dyn Connector>,
    shared: Arc<ChannelShared>,
    canceller: Arc<Canceller>,
    max_command_size: usize,
    out_of_band_queries: bool,
}

impl Device {
    pub fn new(connector: Arc<dyn Connector>, config: &TransportConfig) -> Self {
        let shared = Arc::new(ChannelShared::new(
            config.max_response_size,
            Duration::from_millis(config.transmit_timeout_ms),
        ));
        let channel = DeviceChannel::new(connector.clone(), shared.clone());
        let canceller = channel.canceller();
        Self {
            channel: FairMutex::new(channel),
            connector,
            shared,
            canceller,
            max_command_size: config.max_command_size,
            out_of_band_queries: config.out_of_band_queries,
        }
    }

    /// Wait for exclusive use of the channel, in arrival order.
    pub fn lock(&self) -> FairMutexGuard<'_, DeviceChannel> {
        self.channel.lock()
    }

    /// Callers holding or queued for the channel
    pub fn queue_len(&self) -> u64 {
        self.channel.queue_len()
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn shared(&self) -> &ChannelShared {
        &self.shared
    }

    pub fn canceller(&self) -> &Canceller {
        &self.canceller
    }

    pub fn max_command_size(&self) -> usize {
        self.max_command_size
    }

    /// Whether TPM-backed queries may use a second connection while the
    /// primary channel is open.
    pub fn out_of_band_queries(&self) -> bool {
        self.out_of_band_queries && self.connector.allows_concurrent_connections()
    }
}
