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

//! Isochronous channels and their connection state machine.
//!
//! ```text
//!                 connect            established
//! Disconnected ─────────────▶ Connecting ─────────▶ Connected
//!      │ ▲  security too low      ▲                    │
//!      │ │                        │ security changed   │ disconnect
//!      ▼ │ security failed        │                    ▼
//! EncryptPending ─────────────────┘              Disconnecting
//! ```
//!
//! Every state falls back to Disconnected on a failed establishment or a
//! disconnection, and the `disconnected` callback fires exactly once per
//! fall.

use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::hci::{
    microseconds, slots, BigEstablished, CisEstablished, DataPathDirection, ErrorCode,
    SecurityLevel,
};
use crate::iso::big::BigId;
use crate::iso::buf::Lease;
use crate::iso::cig::CigId;
use crate::iso::qos::{Qos, QosUse};
use crate::iso::{Handle, Inner, Iso, IsoError, Notify};
use crate::packets::{
    IsoFragment, PacketBoundary, PacketStatus, SduHeader, SDU_HEADER_SIZE, TIMESTAMP_SIZE,
};

pub type ChanId = Handle<Chan>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChanState {
    Disconnected,
    Connecting,
    /// Waiting for the ACL connection to reach the required security
    /// level before the CIS can be created.
    EncryptPending,
    Connected,
    Disconnecting,
}

/// Role of the channel on its isochronous stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChanKind {
    Central,
    Peripheral,
    Broadcaster,
    Receiver,
}

/// Per channel callbacks. Every method may call back into [`Iso`].
pub trait ChanOps {
    fn connected(&self, _chan: ChanId) {}
    fn disconnected(&self, _chan: ChanId, _reason: ErrorCode) {}
    fn recv(&self, _chan: ChanId, _info: &RecvInfo, _data: Bytes) {}
    /// One SDU passed to [`Iso::chan_send`] has been fully transmitted.
    fn sent(&self, _chan: ChanId) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvFlags {
    Valid,
    /// The controller flagged the SDU as possibly containing errors.
    Error,
    /// Part of the SDU was lost.
    Lost,
}

impl From<PacketStatus> for RecvFlags {
    fn from(status: PacketStatus) -> Self {
        match status {
            PacketStatus::Valid => RecvFlags::Valid,
            PacketStatus::Invalid => RecvFlags::Error,
            PacketStatus::NoData => RecvFlags::Lost,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecvInfo {
    pub seq_num: u16,
    pub ts: Option<u32>,
    pub flags: RecvFlags,
}

/// Group membership: group handle and CIS_ID or BIS index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GroupRef {
    Cig(CigId, u8),
    Big(BigId, u8),
}

#[derive(Clone, Debug)]
pub(crate) enum Established {
    Cis(CisEstablished),
    Big(BigEstablished),
}

/// Negotiated parameters of one direction, from the local point of view.
#[derive(Clone, Copy, Debug, Default)]
struct Direction {
    bn: u8,
    max_pdu: u16,
    latency: microseconds,
}

impl Established {
    /// Split the negotiated parameters into (tx, rx).
    fn split(&self, kind: ChanKind) -> (Direction, Direction) {
        match self {
            Established::Cis(cis) => {
                let c_to_p = Direction {
                    bn: cis.bn_c_to_p,
                    max_pdu: cis.max_pdu_c_to_p,
                    latency: cis.transport_latency_c_to_p,
                };
                let p_to_c = Direction {
                    bn: cis.bn_p_to_c,
                    max_pdu: cis.max_pdu_p_to_c,
                    latency: cis.transport_latency_p_to_c,
                };
                match kind {
                    ChanKind::Peripheral => (p_to_c, c_to_p),
                    _ => (c_to_p, p_to_c),
                }
            }
            Established::Big(big) => {
                let dir =
                    Direction { bn: big.bn, max_pdu: big.max_pdu, latency: big.transport_latency };
                match kind {
                    ChanKind::Receiver => (Direction::default(), dir),
                    _ => (dir, Direction::default()),
                }
            }
        }
    }

    fn iso_interval(&self) -> slots {
        match self {
            Established::Cis(cis) => cis.iso_interval,
            Established::Big(big) => big.iso_interval,
        }
    }

    fn nse(&self) -> u8 {
        match self {
            Established::Cis(cis) => cis.nse,
            Established::Big(big) => big.nse,
        }
    }
}

/// Isochronous stream the channel is attached to.
#[derive(Clone, Debug)]
pub(crate) struct IsoConn {
    pub handle: u16,
    pub kind: ChanKind,
    pub established: Option<Established>,
    pub can_send: bool,
    pub can_recv: bool,
    /// Data paths set up on the stream.
    pub paths: Vec<DataPathDirection>,
}

impl IsoConn {
    pub fn new(handle: u16, kind: ChanKind) -> IsoConn {
        IsoConn {
            handle,
            kind,
            established: None,
            can_send: false,
            can_recv: false,
            paths: vec![],
        }
    }

    fn reset(&mut self) {
        self.established = None;
        self.can_send = false;
        self.can_recv = false;
        self.paths.clear();
    }
}

/// SDU in flight: one lease per HCI ISO Data packet not yet completed.
struct TxSdu {
    fragments: VecDeque<Lease>,
    notify: bool,
}

pub struct Chan {
    pub(crate) ops: Rc<dyn ChanOps>,
    pub(crate) state: ChanState,
    pub(crate) qos: Option<Qos>,
    pub(crate) required_security: SecurityLevel,
    pub(crate) acl: Option<u16>,
    pub(crate) group: Option<GroupRef>,
    pub(crate) conn: Option<IsoConn>,
    tx: VecDeque<TxSdu>,
}

impl Chan {
    fn new(ops: Rc<dyn ChanOps>) -> Chan {
        Chan {
            ops,
            state: ChanState::Disconnected,
            qos: None,
            required_security: SecurityLevel::default(),
            acl: None,
            group: None,
            conn: None,
            tx: VecDeque::new(),
        }
    }

    pub(crate) fn kind(&self) -> Option<ChanKind> {
        self.conn.as_ref().map(|conn| conn.kind)
    }
}

/// Snapshot of a channel returned by [`Iso::chan_info`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChanInfo {
    pub state: ChanState,
    pub kind: Option<ChanKind>,
    pub handle: Option<u16>,
    pub acl: Option<u16>,
    /// CIG_ID and CIS_ID.
    pub cig: Option<(u8, u8)>,
    /// BIG_Handle and BIS index.
    pub big: Option<(u8, u8)>,
    pub can_send: bool,
    pub can_recv: bool,
    pub iso_interval: slots,
    pub nse: u8,
    pub bn_tx: u8,
    pub bn_rx: u8,
    pub max_pdu_tx: u16,
    pub max_pdu_rx: u16,
    pub latency_tx: microseconds,
    pub latency_rx: microseconds,
}

/// Split an outbound SDU into HCI ISO Data packets with a data load of at
/// most `mtu` bytes.
pub(crate) fn fragment(
    handle: u16,
    mut data: Bytes,
    seq_num: u16,
    ts: Option<u32>,
    mtu: usize,
) -> Vec<IsoFragment> {
    let header_len = SDU_HEADER_SIZE + ts.map_or(0, |_| TIMESTAMP_SIZE);
    let header =
        SduHeader { ts, seq_num, sdu_len: data.len() as u16, status: PacketStatus::Valid };

    let first = data.split_to(data.len().min(mtu - header_len));
    let mut fragments = vec![IsoFragment {
        handle,
        pb: PacketBoundary::Start,
        header: Some(header),
        payload: first,
    }];
    while !data.is_empty() {
        let payload = data.split_to(data.len().min(mtu));
        fragments.push(IsoFragment {
            handle,
            pb: PacketBoundary::Continuation,
            header: None,
            payload,
        });
    }

    let last = fragments.len() - 1;
    fragments[last].pb = if last == 0 { PacketBoundary::Single } else { PacketBoundary::End };
    fragments
}

impl Iso {
    pub fn chan_new(&self, ops: Rc<dyn ChanOps>) -> Result<ChanId, IsoError> {
        let chan = self
            .inner
            .borrow_mut()
            .chans
            .insert_with(|_| Chan::new(ops))
            .ok_or(IsoError::NoFreeChannel)?;
        debug!("{:?}: allocated", chan);
        Ok(chan)
    }

    /// Release an unbound, disconnected channel.
    pub fn chan_free(&self, id: ChanId) -> Result<(), IsoError> {
        let mut inner = self.inner.borrow_mut();
        let chan = inner.chans.get(id).ok_or(IsoError::InvalidChannel)?;
        if chan.group.is_some() {
            return Err(IsoError::AlreadyBound);
        }
        if chan.state != ChanState::Disconnected {
            return Err(IsoError::InvalidState);
        }
        inner.chans.remove(id);
        debug!("{:?}: released", id);
        Ok(())
    }

    pub fn chan_set_qos(&self, id: ChanId, qos: Qos) -> Result<(), IsoError> {
        let mut inner = self.inner.borrow_mut();
        let chan = inner.chans.get_mut(id).ok_or(IsoError::InvalidChannel)?;
        if chan.group.is_some() {
            return Err(IsoError::AlreadyBound);
        }
        if chan.state != ChanState::Disconnected {
            return Err(IsoError::InvalidState);
        }
        qos.validate(QosUse::Unicast)?;
        chan.qos = Some(qos);
        Ok(())
    }

    /// Minimum security level of the ACL connection before the CIS of the
    /// channel can be created.
    pub fn chan_set_security(&self, id: ChanId, level: SecurityLevel) -> Result<(), IsoError> {
        let mut inner = self.inner.borrow_mut();
        let chan = inner.chans.get_mut(id).ok_or(IsoError::InvalidChannel)?;
        if chan.state != ChanState::Disconnected {
            return Err(IsoError::InvalidState);
        }
        chan.required_security = level;
        Ok(())
    }

    /// Select the ACL connection used by [`Iso::chan_connect`].
    pub fn chan_bind(&self, id: ChanId, acl: u16) -> Result<(), IsoError> {
        let mut inner = self.inner.borrow_mut();
        if !inner.acls.contains_key(&acl) {
            return Err(IsoError::UnknownLink);
        }
        let chan = inner.chans.get_mut(id).ok_or(IsoError::InvalidChannel)?;
        if chan.state != ChanState::Disconnected {
            return Err(IsoError::InvalidState);
        }
        chan.acl = Some(acl);
        Ok(())
    }

    pub fn chan_state(&self, id: ChanId) -> Result<ChanState, IsoError> {
        let inner = self.inner.borrow();
        inner.chans.get(id).map(|chan| chan.state).ok_or(IsoError::InvalidChannel)
    }

    pub fn chan_info(&self, id: ChanId) -> Result<ChanInfo, IsoError> {
        let inner = self.inner.borrow();
        let chan = inner.chans.get(id).ok_or(IsoError::InvalidChannel)?;
        let conn = chan.conn.as_ref();
        let established = conn.and_then(|conn| conn.established.as_ref().map(|e| (conn.kind, e)));
        let (tx, rx) = established.map(|(kind, e)| e.split(kind)).unwrap_or_default();

        Ok(ChanInfo {
            state: chan.state,
            kind: chan.kind(),
            handle: conn.map(|conn| conn.handle),
            acl: chan.acl,
            cig: match chan.group {
                Some(GroupRef::Cig(cig, cis_id)) => Some((cig.index(), cis_id)),
                _ => None,
            },
            big: match chan.group {
                Some(GroupRef::Big(big, bis)) => Some((big.index(), bis)),
                _ => None,
            },
            can_send: conn.map_or(false, |conn| conn.can_send),
            can_recv: conn.map_or(false, |conn| conn.can_recv),
            iso_interval: established.map_or(0, |(_, e)| e.iso_interval()),
            nse: established.map_or(0, |(_, e)| e.nse()),
            bn_tx: tx.bn,
            bn_rx: rx.bn,
            max_pdu_tx: tx.max_pdu,
            max_pdu_rx: rx.max_pdu,
            latency_tx: tx.latency,
            latency_rx: rx.latency,
        })
    }

    /// Disconnect a CIS channel. Broadcast channels are released with
    /// [`Iso::big_terminate`].
    pub fn chan_disconnect(&self, id: ChanId) -> Result<(), IsoError> {
        let mut inner = self.inner.borrow_mut();
        let chan = inner.chans.get_mut(id).ok_or(IsoError::InvalidChannel)?;

        match chan.state {
            ChanState::Disconnected | ChanState::Disconnecting => {
                return Err(IsoError::InvalidState);
            }
            ChanState::EncryptPending => {
                self.chan_disconnected(&mut inner, id, ErrorCode::ConnectionTerminatedByLocalHost);
            }
            ChanState::Connecting | ChanState::Connected => {
                let Some(conn) = chan.conn.as_mut() else {
                    return Err(IsoError::NotBound);
                };
                if matches!(conn.kind, ChanKind::Broadcaster | ChanKind::Receiver) {
                    return Err(IsoError::NotSupported);
                }
                self.controller
                    .disconnect(conn.handle, ErrorCode::RemoteUserTerminatedConnection)
                    .map_err(IsoError::Controller)?;
                for direction in conn.paths.drain(..) {
                    if let Err(status) =
                        self.controller.le_remove_iso_data_path(conn.handle, direction)
                    {
                        warn!(
                            "{:?}: failed to remove {:?} data path ({:?})",
                            id, direction, status
                        );
                    }
                }
                info!("{:?}: disconnecting CIS 0x{:x}", id, conn.handle);
                chan.state = ChanState::Disconnecting;
            }
        }

        drop(inner);
        self.flush();
        Ok(())
    }

    /// Queue one SDU for transmission. `sent` fires once every fragment
    /// has been reported completed by the controller.
    pub fn chan_send(
        &self,
        id: ChanId,
        data: Bytes,
        seq_num: u16,
        ts: Option<u32>,
    ) -> Result<(), IsoError> {
        let mut inner = self.inner.borrow_mut();
        let chan = inner.chans.get_mut(id).ok_or(IsoError::InvalidChannel)?;
        if chan.state != ChanState::Connected {
            return Err(IsoError::InvalidState);
        }
        let Some(conn) = chan.conn.as_ref().filter(|conn| conn.can_send) else {
            return Err(IsoError::NotSupported);
        };
        let max_sdu = chan.qos.as_ref().and_then(|qos| qos.tx.as_ref()).map_or(0, |io| io.sdu);
        if data.len() > max_sdu as usize {
            return Err(IsoError::PayloadTooLarge(data.len()));
        }

        let fragments = fragment(conn.handle, data, seq_num, ts, self.config.iso_mtu);
        if fragments.len() > self.tx_pool.available() {
            debug!("{:?}: {} tx buffers needed", id, fragments.len());
            return Err(IsoError::NoBuffers);
        }

        let mut sdu = TxSdu { fragments: VecDeque::new(), notify: true };
        let mut result = Ok(());
        for fragment in fragments {
            let Some(mut buf) = self.tx_pool.alloc() else {
                result = Err(IsoError::NoBuffers);
                break;
            };
            if let Err(err) = fragment.encode(buf.data_mut()) {
                result = Err(err.into());
                break;
            }
            let (packet, lease) = buf.into_parts();
            if let Err(status) = self.controller.send_iso_data(packet) {
                result = Err(IsoError::Controller(status));
                break;
            }
            sdu.fragments.push_back(lease);
        }

        // Packets already handed to the controller are still completed
        // later; keep their leases, but do not report the SDU as sent.
        sdu.notify = result.is_ok();
        if !sdu.fragments.is_empty() {
            chan.tx.push_back(sdu);
        }
        result
    }

    /// HCI Number Of Completed Packets for one connection handle.
    pub fn num_completed_packets(&self, handle: u16, count: usize) {
        let mut inner = self.inner.borrow_mut();
        let Some(id) = inner.chan_by_handle(handle) else {
            debug!("completed packets for unknown handle 0x{:x}", handle);
            return;
        };
        let Some(chan) = inner.chans.get_mut(id) else {
            return;
        };

        for _ in 0..count {
            let done = match chan.tx.front_mut() {
                Some(sdu) => {
                    sdu.fragments.pop_front();
                    sdu.fragments.is_empty()
                }
                None => {
                    warn!("{:?}: more packets completed than sent", id);
                    break;
                }
            };
            if done && chan.tx.pop_front().map_or(false, |sdu| sdu.notify) {
                self.notify(Notify::Sent(chan.ops.clone(), id));
            }
        }

        drop(inner);
        self.flush();
    }

    /// HCI LE CIS Established.
    pub fn cis_established(&self, handle: u16, status: ErrorCode, params: &CisEstablished) {
        let mut inner = self.inner.borrow_mut();
        let Some(id) = inner.chan_by_handle(handle) else {
            warn!("CIS established for unknown handle 0x{:x}", handle);
            return;
        };
        let state = inner.chans.get(id).map(|chan| chan.state);
        if !status.is_success() {
            // Also ends a creation cancelled by a local disconnect.
            self.chan_disconnected(&mut inner, id, status);
        } else if state == Some(ChanState::Connecting) {
            self.chan_established(&mut inner, id, Established::Cis(params.clone()));
        } else {
            warn!("{:?}: unexpected CIS established in state {:?}", id, state);
        }

        drop(inner);
        self.flush();
    }

    /// HCI Disconnection Complete, for either a CIS or an ACL connection.
    pub fn disconnection_complete(&self, handle: u16, reason: ErrorCode) {
        let mut inner = self.inner.borrow_mut();
        if let Some(id) = inner.chan_by_handle(handle) {
            match inner.chans.get(id).and_then(Chan::kind) {
                Some(ChanKind::Central) | Some(ChanKind::Peripheral) => {
                    self.chan_disconnected(&mut inner, id, reason)
                }
                _ => warn!("{:?}: disconnection of BIS 0x{:x} ignored", id, handle),
            }
        } else if inner.acls.contains_key(&handle) {
            self.acl_lost(&mut inner, handle, reason);
        } else {
            debug!("disconnection of unknown handle 0x{:x}", handle);
        }

        drop(inner);
        self.flush();
    }

    /// Record the negotiated parameters of a stream, set up its data paths
    /// and report the channel connected. A data path failure aborts the
    /// whole stream, or the whole group for broadcast streams.
    pub(crate) fn chan_established(&self, inner: &mut Inner, id: ChanId, established: Established) {
        let Some(chan) = inner.chans.get_mut(id) else {
            return;
        };
        let Some(conn) = chan.conn.as_mut() else {
            return;
        };
        let qos = chan.qos.clone().unwrap_or_default();
        let (tx, rx) = established.split(conn.kind);
        conn.can_send = tx.bn > 0 && qos.tx.is_some();
        conn.can_recv = rx.bn > 0 && qos.rx.is_some();
        conn.established = Some(established);

        let mut directions = vec![];
        if conn.can_send {
            directions.push((DataPathDirection::Input, qos.tx.and_then(|io| io.path)));
        }
        if conn.can_recv {
            directions.push((DataPathDirection::Output, qos.rx.and_then(|io| io.path)));
        }

        let mut failure = None;
        for (direction, path) in directions {
            // The default path is HCI with transparent coding.
            let path = path.unwrap_or_default();
            match self.controller.le_setup_iso_data_path(conn.handle, direction, &path) {
                Ok(()) => conn.paths.push(direction),
                Err(status) => {
                    failure = Some(status);
                    break;
                }
            }
        }

        let Some(status) = failure else {
            info!(
                "{:?}: connected on 0x{:x} (send: {}, recv: {})",
                id, conn.handle, conn.can_send, conn.can_recv
            );
            chan.state = ChanState::Connected;
            self.notify(Notify::Connected(chan.ops.clone(), id));
            return;
        };

        warn!("{:?}: data path setup failed on 0x{:x} ({:?})", id, conn.handle, status);
        let handle = conn.handle;
        let group = chan.group;
        match group {
            Some(GroupRef::Big(big, _)) => self.big_abort(inner, big, status),
            _ => {
                chan.state = ChanState::Disconnecting;
                if let Err(err) =
                    self.controller.disconnect(handle, ErrorCode::RemoteUserTerminatedConnection)
                {
                    warn!("{:?}: disconnect failed ({:?})", id, err);
                    self.chan_disconnected(inner, id, status);
                }
            }
        }
    }

    /// Move a channel to Disconnected and queue its `disconnected`
    /// callback. No-op for a channel already disconnected.
    pub(crate) fn chan_disconnected(&self, inner: &mut Inner, id: ChanId, reason: ErrorCode) {
        let Some(chan) = inner.chans.get_mut(id) else {
            return;
        };
        if chan.state == ChanState::Disconnected {
            return;
        }

        info!("{:?}: disconnected from {:?} ({:?})", id, chan.state, reason);
        chan.state = ChanState::Disconnected;
        chan.tx.clear();
        let handle = chan.conn.as_ref().map(|conn| conn.handle);
        if chan.kind() == Some(ChanKind::Peripheral) {
            // Accepted CIS are bound to the channel for one connection only.
            chan.conn = None;
            chan.acl = None;
        } else if let Some(conn) = chan.conn.as_mut() {
            conn.reset();
        }
        self.notify(Notify::Disconnected(chan.ops.clone(), id, reason));

        let group = chan.group;
        if let Some(handle) = handle {
            inner.rx.remove(&handle);
        }
        if let Some(GroupRef::Cig(cig, _)) = group {
            self.cig_update_state(inner, cig);
        }
    }
}
