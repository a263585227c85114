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

//! Quality of service descriptors and group timing parameters.

use std::convert::TryFrom;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use tracing::debug;

use crate::hci::{self, microseconds, DataPath};
use crate::iso::config::MAX_SDU;
use crate::iso::IsoError;

pub const SDU_INTERVAL_MIN: microseconds = 0xff;
pub const SDU_INTERVAL_MAX: microseconds = 0xf_ffff;
pub const LATENCY_MIN: u16 = 0x5;
pub const LATENCY_MAX: u16 = 0xfa0;
pub const BROADCAST_RTN_MAX: u8 = 0x1e;
pub const SCA_MAX: u8 = 0x7;
pub const CONTROLLER_DELAY_MAX: microseconds = 0x3d_0900;
pub const CODEC_CONFIGURATION_MAX: usize = 0xff;
pub const MSE_MAX: u8 = 0x1f;
pub const SYNC_TIMEOUT_MIN: u16 = 0xa;
pub const SYNC_TIMEOUT_MAX: u16 = 0x4000;

const PHY_MASK: u8 = hci::PHY_LE_1M | hci::PHY_LE_2M | hci::PHY_LE_CODED;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromPrimitive)]
pub enum Packing {
    #[default]
    Sequential = 0x0,
    Interleaved = 0x1,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromPrimitive)]
pub enum Framing {
    #[default]
    Unframed = 0x0,
    Framed = 0x1,
}

impl TryFrom<u8> for Packing {
    type Error = IsoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Packing::from_u8(value).ok_or(IsoError::InvalidParameters("unknown packing"))
    }
}

impl TryFrom<u8> for Framing {
    type Error = IsoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Framing::from_u8(value).ok_or(IsoError::InvalidParameters("unknown framing"))
    }
}

/// QoS of one direction of a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IoQos {
    /// Maximum SDU size, in octets.
    pub sdu: u16,
    /// Bitmask of the PHYs the controller may pick from.
    pub phy: u8,
    /// Retransmission number.
    pub rtn: u8,
    /// Data path to set up once the stream is established. The HCI data
    /// path with transparent coding is used when absent.
    pub path: Option<DataPath>,
}

/// QoS of a stream; at least one direction must be present.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Qos {
    /// Local transmit direction.
    pub tx: Option<IoQos>,
    /// Local receive direction.
    pub rx: Option<IoQos>,
}

/// Timing shared by every CIS of a CIG.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CigTiming {
    /// SDU interval, in microseconds.
    pub interval: microseconds,
    /// Maximum transport latency, in milliseconds.
    pub latency: u16,
    /// Worst case sleep clock accuracy.
    pub sca: u8,
    pub packing: Packing,
    pub framing: Framing,
}

/// Timing of a broadcast BIG.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BigTiming {
    pub interval: microseconds,
    pub latency: u16,
    pub packing: Packing,
    pub framing: Framing,
    pub broadcast_code: Option<[u8; 16]>,
}

/// Parameters of the synchronization to a remote BIG.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BigSyncTiming {
    /// BIS indices to synchronize to; bit n selects BIS n + 1.
    pub bis_bitfield: u32,
    /// Maximum number of subevents to receive per BIS event, 0 lets the
    /// controller decide.
    pub mse: u8,
    /// Synchronization timeout, in units of 10 ms.
    pub sync_timeout: u16,
    pub broadcast_code: Option<[u8; 16]>,
}

/// How a channel's QoS is going to be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QosUse {
    Unicast,
    Broadcaster,
    Receiver,
}

fn validate_path(path: &DataPath) -> Result<(), IsoError> {
    if path.controller_delay > CONTROLLER_DELAY_MAX {
        return Err(IsoError::InvalidQos("controller delay out of range"));
    }
    if path.codec_configuration.len() > CODEC_CONFIGURATION_MAX {
        return Err(IsoError::InvalidQos("codec configuration too long"));
    }
    // A codec configuration is meaningless with transparent coding.
    if !path.codec_configuration.is_empty()
        && path.codec_id.coding_format == hci::CODING_FORMAT_TRANSPARENT
    {
        return Err(IsoError::InvalidQos("codec configuration with transparent coding"));
    }
    Ok(())
}

fn validate_io_qos(io: &IoQos, broadcast: bool) -> Result<(), IsoError> {
    if io.sdu as usize > MAX_SDU {
        return Err(IsoError::InvalidQos("SDU size out of range"));
    }
    if io.phy == 0 || io.phy & !PHY_MASK != 0 {
        return Err(IsoError::InvalidQos("invalid PHY"));
    }
    if broadcast && io.rtn > BROADCAST_RTN_MAX {
        return Err(IsoError::InvalidQos("retransmission number out of range"));
    }
    io.path.as_ref().map_or(Ok(()), validate_path)
}

impl Qos {
    pub(crate) fn validate(&self, usage: QosUse) -> Result<(), IsoError> {
        match usage {
            QosUse::Unicast if self.tx.is_none() && self.rx.is_none() => {
                return Err(IsoError::InvalidQos("neither tx nor rx QoS"));
            }
            QosUse::Broadcaster if self.tx.is_none() => {
                return Err(IsoError::InvalidQos("broadcaster without tx QoS"));
            }
            QosUse::Receiver if self.rx.is_none() => {
                return Err(IsoError::InvalidQos("receiver without rx QoS"));
            }
            _ => (),
        }

        let broadcast = usage != QosUse::Unicast;
        if let Some(tx) = self.tx.as_ref().filter(|_| usage != QosUse::Receiver) {
            validate_io_qos(tx, broadcast)?;
        }
        if let Some(rx) = self.rx.as_ref().filter(|_| usage != QosUse::Broadcaster) {
            validate_io_qos(rx, broadcast)?;
        }
        Ok(())
    }
}

fn validate_interval_and_latency(interval: microseconds, latency: u16) -> Result<(), IsoError> {
    if !(SDU_INTERVAL_MIN..=SDU_INTERVAL_MAX).contains(&interval) {
        debug!("invalid SDU interval ({})", interval);
        return Err(IsoError::InvalidParameters("SDU interval out of range"));
    }
    if !(LATENCY_MIN..=LATENCY_MAX).contains(&latency) {
        debug!("invalid max transport latency ({})", latency);
        return Err(IsoError::InvalidParameters("latency out of range"));
    }
    Ok(())
}

impl CigTiming {
    pub(crate) fn validate(&self) -> Result<(), IsoError> {
        validate_interval_and_latency(self.interval, self.latency)?;
        if self.sca > SCA_MAX {
            return Err(IsoError::InvalidParameters("sleep clock accuracy out of range"));
        }
        Ok(())
    }
}

impl BigTiming {
    pub(crate) fn validate(&self) -> Result<(), IsoError> {
        validate_interval_and_latency(self.interval, self.latency)
    }
}

impl BigSyncTiming {
    pub(crate) fn validate(&self, num_bis: usize) -> Result<(), IsoError> {
        if self.bis_bitfield == 0 || self.bis_bitfield & 0x8000_0000 != 0 {
            return Err(IsoError::InvalidParameters("invalid BIS bitfield"));
        }
        if self.bis_bitfield.count_ones() as usize != num_bis {
            return Err(IsoError::InvalidParameters("BIS bitfield does not match the channels"));
        }
        if self.mse > MSE_MAX {
            return Err(IsoError::InvalidParameters("MSE out of range"));
        }
        if !(SYNC_TIMEOUT_MIN..=SYNC_TIMEOUT_MAX).contains(&self.sync_timeout) {
            return Err(IsoError::InvalidParameters("sync timeout out of range"));
        }
        Ok(())
    }

    /// BIS indices selected by the bitfield, in ascending order.
    pub(crate) fn bis_indices(&self) -> Vec<u8> {
        (0..31u8).filter(|bit| self.bis_bitfield & (1u32 << bit) != 0).map(|bit| bit + 1).collect()
    }
}
