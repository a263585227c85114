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

//! HCI ISO Data packets, Vol 4, Part E § 5.4.5.
//!
//! ```text
//! | Handle:12 | PB_Flag:2 | TS_Flag:1 | RFU:1 | ISO_Data_Load_Length:14 | RFU:2 |
//! ISO_Data_Load (first fragment only):
//! | Time_Stamp:32 (TS_Flag) | Packet_Sequence_Number:16 |
//! | ISO_SDU_Length:12 | RFU:2 | Packet_Status_Flag:2 | ISO_SDU_Fragment |
//! ```

use bytes::{Buf, BufMut, Bytes};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

pub const ISO_HEADER_SIZE: usize = 4;
pub const SDU_HEADER_SIZE: usize = 4;
pub const TIMESTAMP_SIZE: usize = 4;

const HANDLE_MASK: u16 = 0x0fff;
const DATA_LOAD_LENGTH_MASK: u16 = 0x3fff;
const SDU_LENGTH_MASK: u16 = 0x0fff;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("ISO packet truncated")]
    Truncated,
    #[error("ISO data load length {declared} does not match the {actual} bytes received")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Reserved packet status flag")]
    ReservedStatus,
    #[error("Time stamp present on a continuation fragment")]
    UnexpectedTimestamp,
    #[error("ISO SDU length {0} exceeds 12 bits")]
    SduTooLong(usize),
}

/// PB_Flag of an HCI ISO Data packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum PacketBoundary {
    Start = 0x0,
    Continuation = 0x1,
    Single = 0x2,
    End = 0x3,
}

impl PacketBoundary {
    /// Start and Single fragments open a new SDU and carry its header.
    pub fn is_first(&self) -> bool {
        matches!(self, PacketBoundary::Start | PacketBoundary::Single)
    }
}

/// Packet_Status_Flag of a received SDU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromPrimitive)]
pub enum PacketStatus {
    /// Valid data.
    #[default]
    Valid = 0x0,
    /// Possibly invalid data; some bits may be in error.
    Invalid = 0x1,
    /// Part(s) of the SDU were not received.
    NoData = 0x2,
}

/// Header of the first fragment of an SDU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SduHeader {
    pub ts: Option<u32>,
    pub seq_num: u16,
    pub sdu_len: u16,
    pub status: PacketStatus,
}

/// One HCI ISO Data packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IsoFragment {
    pub handle: u16,
    pub pb: PacketBoundary,
    /// Present for Start and Single fragments only.
    pub header: Option<SduHeader>,
    pub payload: Bytes,
}

impl IsoFragment {
    pub fn parse(mut data: Bytes) -> Result<IsoFragment, PacketError> {
        if data.len() < ISO_HEADER_SIZE {
            return Err(PacketError::Truncated);
        }

        let handle_and_flags = data.get_u16_le();
        let data_load_length = (data.get_u16_le() & DATA_LOAD_LENGTH_MASK) as usize;
        let handle = handle_and_flags & HANDLE_MASK;
        let pb = PacketBoundary::from_u16((handle_and_flags >> 12) & 0x3)
            .ok_or(PacketError::Truncated)?;
        let ts_flag = (handle_and_flags >> 14) & 0x1 != 0;

        if data.len() != data_load_length {
            return Err(PacketError::LengthMismatch {
                declared: data_load_length,
                actual: data.len(),
            });
        }

        let header = if pb.is_first() {
            let needed = SDU_HEADER_SIZE + if ts_flag { TIMESTAMP_SIZE } else { 0 };
            if data.len() < needed {
                return Err(PacketError::Truncated);
            }
            let ts = ts_flag.then(|| data.get_u32_le());
            let seq_num = data.get_u16_le();
            let sdu_len_and_status = data.get_u16_le();
            let status = PacketStatus::from_u16(sdu_len_and_status >> 14)
                .ok_or(PacketError::ReservedStatus)?;
            Some(SduHeader { ts, seq_num, sdu_len: sdu_len_and_status & SDU_LENGTH_MASK, status })
        } else if ts_flag {
            return Err(PacketError::UnexpectedTimestamp);
        } else {
            None
        };

        Ok(IsoFragment { handle, pb, header, payload: data })
    }

    pub fn encoded_len(&self) -> usize {
        ISO_HEADER_SIZE + self.data_load_len()
    }

    fn data_load_len(&self) -> usize {
        let header_len = match self.header {
            Some(SduHeader { ts: Some(_), .. }) => TIMESTAMP_SIZE + SDU_HEADER_SIZE,
            Some(SduHeader { ts: None, .. }) => SDU_HEADER_SIZE,
            None => 0,
        };
        header_len + self.payload.len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) -> Result<(), PacketError> {
        let data_load_len = self.data_load_len();
        if data_load_len > DATA_LOAD_LENGTH_MASK as usize {
            return Err(PacketError::LengthMismatch {
                declared: DATA_LOAD_LENGTH_MASK as usize,
                actual: data_load_len,
            });
        }
        let ts_flag = matches!(self.header, Some(SduHeader { ts: Some(_), .. }));

        buf.put_u16_le(
            (self.handle & HANDLE_MASK) | ((self.pb as u16) << 12) | ((ts_flag as u16) << 14),
        );
        buf.put_u16_le(data_load_len as u16);

        if let Some(header) = self.header {
            if header.sdu_len > SDU_LENGTH_MASK {
                return Err(PacketError::SduTooLong(header.sdu_len as usize));
            }
            if let Some(ts) = header.ts {
                buf.put_u32_le(ts);
            }
            buf.put_u16_le(header.seq_num);
            buf.put_u16_le(header.sdu_len | ((header.status as u16) << 14));
        }
        buf.put_slice(&self.payload);
        Ok(())
    }
}
