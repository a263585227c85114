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

//! Reassembly of inbound SDUs from HCI ISO Data packets.
//!
//! One SDU at most is in progress per connection handle. Any sequencing
//! error drops the SDU in progress; the next Start or Single fragment
//! begins a fresh one, so channels only ever see complete SDUs.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::iso::buf::PoolBuf;
use crate::iso::chan::{ChanState, RecvInfo};
use crate::iso::{Iso, IsoError, Notify};
use crate::packets::{IsoFragment, PacketBoundary, SduHeader};

/// SDU in progress on one connection handle.
pub(crate) struct Reassembly {
    buf: PoolBuf,
    header: SduHeader,
}

impl Reassembly {
    fn remaining(&self) -> usize {
        (self.header.sdu_len as usize).saturating_sub(self.buf.len())
    }

    fn complete(self) -> (RecvInfo, Bytes) {
        let info = RecvInfo {
            seq_num: self.header.seq_num,
            ts: self.header.ts,
            flags: self.header.status.into(),
        };
        (info, self.buf.freeze())
    }
}

impl Iso {
    /// Inbound HCI ISO Data packet.
    pub fn iso_data(&self, packet: Bytes) -> Result<(), IsoError> {
        let fragment = IsoFragment::parse(packet).map_err(|err| {
            warn!("dropping malformed ISO packet: {}", err);
            err
        })?;
        self.recv_fragment(fragment);
        Ok(())
    }

    fn recv_fragment(&self, fragment: IsoFragment) {
        let mut inner = self.inner.borrow_mut();
        let handle = fragment.handle;

        let Some(id) = inner.chan_by_handle(handle) else {
            debug!("ISO data for unknown handle 0x{:x}", handle);
            return;
        };
        let Some(chan) = inner.chans.get(id) else {
            return;
        };
        let receiving = chan.conn.as_ref().map_or(false, |conn| conn.can_recv);
        if chan.state != ChanState::Connected || !receiving {
            debug!("{:?}: not receiving, ISO data on 0x{:x} dropped", id, handle);
            return;
        }
        let ops = chan.ops.clone();

        if let Some((info, data)) = self.reassemble(&mut inner.rx, fragment) {
            trace!("{:?}: SDU {} complete, {} bytes", id, info.seq_num, data.len());
            self.notify(Notify::Recv(ops, id, info, data));
        }

        drop(inner);
        self.flush();
    }

    /// Add one fragment to the SDU in progress on its handle, and return
    /// the SDU once complete.
    fn reassemble(
        &self,
        rx: &mut HashMap<u16, Reassembly>,
        fragment: IsoFragment,
    ) -> Option<(RecvInfo, Bytes)> {
        let handle = fragment.handle;
        let in_progress = rx.remove(&handle);

        match fragment.pb {
            PacketBoundary::Start | PacketBoundary::Single => {
                if let Some(sdu) = in_progress {
                    warn!(
                        "0x{:x}: {:?} fragment with SDU {} in progress, dropping it",
                        handle, fragment.pb, sdu.header.seq_num
                    );
                }
                let header = fragment.header?;
                let sdu_len = header.sdu_len as usize;
                if fragment.payload.len() > sdu_len {
                    warn!(
                        "0x{:x}: {} bytes in first fragment of a {} byte SDU",
                        handle,
                        fragment.payload.len(),
                        sdu_len
                    );
                    return None;
                }
                if sdu_len > self.rx_pool.buf_size() {
                    warn!("0x{:x}: SDU of {} bytes does not fit an rx buffer", handle, sdu_len);
                    return None;
                }
                let Some(mut buf) = self.rx_pool.alloc() else {
                    warn!("0x{:x}: no rx buffer, SDU {} dropped", handle, header.seq_num);
                    return None;
                };
                buf.append(&fragment.payload).ok()?;

                let sdu = Reassembly { buf, header };
                if fragment.pb == PacketBoundary::Single || sdu.remaining() == 0 {
                    return Some(sdu.complete());
                }
                rx.insert(handle, sdu);
                None
            }
            PacketBoundary::Continuation | PacketBoundary::End => {
                // A start without payload leaves nothing to continue.
                let Some(mut sdu) = in_progress.filter(|sdu| !sdu.buf.is_empty()) else {
                    warn!("0x{:x}: {:?} fragment without a start", handle, fragment.pb);
                    return None;
                };
                if fragment.payload.len() > sdu.remaining() {
                    warn!(
                        "0x{:x}: SDU {} overflows, {} bytes for {} remaining",
                        handle,
                        sdu.header.seq_num,
                        fragment.payload.len(),
                        sdu.remaining()
                    );
                    return None;
                }
                sdu.buf.append(&fragment.payload).ok()?;

                if fragment.pb == PacketBoundary::End {
                    return Some(sdu.complete());
                }
                rx.insert(handle, sdu);
                None
            }
        }
    }
}
