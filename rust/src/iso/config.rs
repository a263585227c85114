// Copyright 2023 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::iso::arena::MAX_CAPACITY;
use crate::iso::IsoError;

/// Maximum number of CIS in a CIG, or BIS in a BIG.
pub const MAX_GROUP_ISO_COUNT: usize = 0x1f;

/// Highest valid CIG_ID and BIG_Handle.
pub const MAX_GROUP_ID: usize = 0xef;

/// Largest ISO_SDU_Length representable in an HCI ISO Data packet.
pub const MAX_SDU: usize = 0x0fff;

/// Size and count of a fixed capacity buffer pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub count: usize,
    pub buf_size: usize,
}

/// Static limits of an isochronous core instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IsoConfig {
    pub max_chan: usize,
    pub max_cig: usize,
    pub max_cis_per_cig: usize,
    pub max_big: usize,
    pub max_bis_per_big: usize,
    /// Buffers holding reassembled inbound SDUs.
    pub rx_pool: PoolConfig,
    /// Buffers holding outbound HCI ISO Data packets until completed.
    pub tx_pool: PoolConfig,
    /// Controller ISO_Data_Packet_Length: the largest data load of an
    /// outbound HCI ISO Data packet.
    pub iso_mtu: usize,
}

impl Default for IsoConfig {
    fn default() -> Self {
        IsoConfig {
            max_chan: 8,
            max_cig: 2,
            max_cis_per_cig: 4,
            max_big: 2,
            max_bis_per_big: 4,
            rx_pool: PoolConfig { count: 4, buf_size: 251 },
            tx_pool: PoolConfig { count: 8, buf_size: 251 + 12 },
            iso_mtu: 251,
        }
    }
}

impl IsoConfig {
    pub fn with_max_chan(mut self, max_chan: usize) -> Self {
        self.max_chan = max_chan;
        self
    }

    pub fn with_max_cig(mut self, max_cig: usize, max_cis_per_cig: usize) -> Self {
        self.max_cig = max_cig;
        self.max_cis_per_cig = max_cis_per_cig;
        self
    }

    pub fn with_max_big(mut self, max_big: usize, max_bis_per_big: usize) -> Self {
        self.max_big = max_big;
        self.max_bis_per_big = max_bis_per_big;
        self
    }

    pub fn with_rx_pool(mut self, count: usize, buf_size: usize) -> Self {
        self.rx_pool = PoolConfig { count, buf_size };
        self
    }

    pub fn with_tx_pool(mut self, count: usize, buf_size: usize) -> Self {
        self.tx_pool = PoolConfig { count, buf_size };
        self
    }

    pub fn with_iso_mtu(mut self, iso_mtu: usize) -> Self {
        self.iso_mtu = iso_mtu;
        self
    }

    pub fn validate(&self) -> Result<(), IsoError> {
        let invalid = |reason| Err(IsoError::InvalidConfig(reason));

        if self.max_chan == 0 || self.max_chan > MAX_CAPACITY {
            return invalid("max_chan out of range");
        }
        if self.max_cig > MAX_GROUP_ID + 1 || self.max_big > MAX_GROUP_ID + 1 {
            return invalid("group count exceeds the HCI identifier range");
        }
        if self.max_cis_per_cig == 0 || self.max_cis_per_cig > MAX_GROUP_ISO_COUNT {
            return invalid("max_cis_per_cig out of range");
        }
        if self.max_bis_per_big == 0 || self.max_bis_per_big > MAX_GROUP_ISO_COUNT {
            return invalid("max_bis_per_big out of range");
        }
        if self.rx_pool.count == 0 || self.rx_pool.buf_size == 0 {
            return invalid("empty rx pool");
        }
        if self.tx_pool.count == 0 || self.tx_pool.buf_size == 0 {
            return invalid("empty tx pool");
        }
        // Every outbound fragment must fit a tx buffer, headers included.
        if self.iso_mtu <= crate::packets::SDU_HEADER_SIZE + crate::packets::TIMESTAMP_SIZE
            || self.tx_pool.buf_size < self.iso_mtu + crate::packets::ISO_HEADER_SIZE
        {
            return invalid("iso_mtu does not fit the tx buffers");
        }
        Ok(())
    }
}
