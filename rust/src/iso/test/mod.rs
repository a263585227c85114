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

mod controller;

pub use context::{TestContext, TestEvent, TestOps};
pub use controller::{Command, Op, TestController};

use crate::hci::{BigEstablished, PHY_LE_2M};
use crate::iso::qos::{BigSyncTiming, BigTiming, CigTiming, Framing, IoQos, Packing};

/// Central ACL connection registered by [`TestContext::acl`].
pub const ACL_HANDLE: u16 = 0x0001;

pub fn io_qos(sdu: u16) -> IoQos {
    IoQos { sdu, phy: PHY_LE_2M, rtn: 2, path: None }
}

pub fn cig_timing() -> CigTiming {
    CigTiming {
        interval: 10_000,
        latency: 10,
        sca: 0,
        packing: Packing::Sequential,
        framing: Framing::Unframed,
    }
}

pub fn big_timing() -> BigTiming {
    BigTiming {
        interval: 10_000,
        latency: 20,
        packing: Packing::Sequential,
        framing: Framing::Unframed,
        broadcast_code: None,
    }
}

pub fn big_sync_timing() -> BigSyncTiming {
    BigSyncTiming { bis_bitfield: 0x1, mse: 0, sync_timeout: 0x64, broadcast_code: None }
}

/// Parameters of LE Create BIG Complete and LE BIG Sync Established.
pub fn big_params() -> BigEstablished {
    BigEstablished {
        transport_latency: 20_000,
        phy: PHY_LE_2M,
        nse: 4,
        bn: 1,
        pto: 0,
        irc: 2,
        max_pdu: 100,
        iso_interval: 8,
    }
}
