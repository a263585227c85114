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

//! Broadcast Isochronous Groups.
//!
//! A BIG is either created locally for broadcasting, bound to a periodic
//! advertising set, or synchronized to from a periodic advertising sync.
//! Both are set up in two steps: the command is acknowledged first, then
//! a completion event carries the BIS connection handles.

use tracing::{debug, info, warn};

use crate::hci::{BigEstablished, BigParameters, BigSyncParameters, ErrorCode, PHY_LE_2M};
use crate::iso::chan::{ChanId, ChanKind, ChanState, Established, GroupRef, IsoConn};
use crate::iso::qos::{BigSyncTiming, BigTiming, IoQos, QosUse};
use crate::iso::{BindGuard, Handle, Inner, Iso, IsoError, Slot};

/// BIG handle; the slot index is the BIG_Handle.
pub type BigId = Handle<Big>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BigState {
    /// Not allocated.
    Idle,
    /// LE Create BIG acknowledged, waiting for LE Create BIG Complete.
    CreatePending,
    /// LE BIG Create Sync acknowledged, waiting for LE BIG Sync
    /// Established.
    SyncPending,
    Broadcasting,
    Synced,
    /// LE Terminate BIG acknowledged, waiting for LE Terminate BIG
    /// Complete.
    TerminatePending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BigRole {
    Broadcaster { adv_handle: u8 },
    Receiver { sync_handle: u16 },
}

pub struct Big {
    pub(crate) state: BigState,
    pub(crate) role: BigRole,
    /// Members in BIS order.
    pub(crate) members: Vec<ChanId>,
}

impl Inner {
    fn set_live_members_state(&mut self, big: BigId, state: ChanState) {
        let members = self.bigs.get(big).map(|group| group.members.clone()).unwrap_or_default();
        for id in members {
            if let Some(chan) = self.chans.get_mut(id) {
                if chan.state != ChanState::Disconnected {
                    chan.state = state;
                }
            }
        }
    }
}

impl Iso {
    /// Create a BIG broadcasting one BIS per channel on the periodic
    /// advertising set `adv_handle`.
    pub fn big_create_broadcast(
        &self,
        members: &[ChanId],
        timing: BigTiming,
        adv_handle: u8,
    ) -> Result<BigId, IsoError> {
        timing.validate()?;
        let mut inner = self.inner.borrow_mut();
        inner.check_members(members, self.config.max_bis_per_big, QosUse::Broadcaster)?;

        let role = BigRole::Broadcaster { adv_handle };
        if inner.bigs.find(|big| big.role == role).is_some() {
            info!("advertising set {} already has a BIG", adv_handle);
            return Err(IsoError::Busy);
        }

        let big = inner
            .bigs
            .insert_with(|_| Big {
                state: BigState::CreatePending,
                role,
                members: members.to_vec(),
            })
            .ok_or(IsoError::NoFreeGroup)?;
        let mut guard = BindGuard::new(&mut inner, Some(Slot::Big(big)));
        for (index, id) in members.iter().enumerate() {
            guard.bind(*id, GroupRef::Big(big, index as u8 + 1));
        }

        let tx: Vec<IoQos> = members
            .iter()
            .filter_map(|id| guard.chans.get(*id))
            .filter_map(|chan| chan.qos.as_ref().and_then(|qos| qos.tx.clone()))
            .collect();
        let parameters = BigParameters {
            big_handle: big.index(),
            advertising_handle: adv_handle,
            num_bis: members.len() as u8,
            sdu_interval: timing.interval,
            max_sdu: tx.iter().map(|io| io.sdu).max().unwrap_or(0),
            max_transport_latency: timing.latency,
            rtn: tx.iter().map(|io| io.rtn).max().unwrap_or(0),
            phy: tx.first().map_or(PHY_LE_2M, |io| io.phy),
            packing: timing.packing as u8,
            framing: timing.framing as u8,
            broadcast_code: timing.broadcast_code,
        };
        self.controller.le_create_big(&parameters).map_err(|status| {
            warn!("BIG {} creation failed ({:?})", big.index(), status);
            IsoError::Controller(status)
        })?;

        for id in members {
            if let Some(chan) = guard.chans.get_mut(*id) {
                chan.state = ChanState::Connecting;
            }
        }
        guard.disarm();

        info!("BIG {}: creating with {} BIS", big.index(), members.len());
        Ok(big)
    }

    /// Synchronize to the BIS selected by `timing.bis_bitfield` of the BIG
    /// announced on the periodic advertising sync `sync_handle`, one
    /// channel per BIS in ascending BIS order.
    pub fn big_sync(
        &self,
        sync_handle: u16,
        timing: BigSyncTiming,
        members: &[ChanId],
    ) -> Result<BigId, IsoError> {
        let mut inner = self.inner.borrow_mut();
        if !inner.per_syncs.contains(&sync_handle) {
            return Err(IsoError::NotSynchronized);
        }
        inner.check_members(members, self.config.max_bis_per_big, QosUse::Receiver)?;
        timing.validate(members.len())?;

        let role = BigRole::Receiver { sync_handle };
        if inner.bigs.find(|big| big.role == role).is_some() {
            info!("periodic sync 0x{:x} already has a BIG", sync_handle);
            return Err(IsoError::Busy);
        }

        let big = inner
            .bigs
            .insert_with(|_| Big { state: BigState::SyncPending, role, members: members.to_vec() })
            .ok_or(IsoError::NoFreeGroup)?;
        let mut guard = BindGuard::new(&mut inner, Some(Slot::Big(big)));
        let bis = timing.bis_indices();
        for (id, index) in members.iter().zip(&bis) {
            guard.bind(*id, GroupRef::Big(big, *index));
        }

        let parameters = BigSyncParameters {
            big_handle: big.index(),
            sync_handle,
            broadcast_code: timing.broadcast_code,
            mse: timing.mse,
            big_sync_timeout: timing.sync_timeout,
            bis,
        };
        self.controller.le_big_create_sync(&parameters).map_err(|status| {
            warn!("BIG {} sync failed ({:?})", big.index(), status);
            IsoError::Controller(status)
        })?;

        for id in members {
            if let Some(chan) = guard.chans.get_mut(*id) {
                chan.state = ChanState::Connecting;
            }
        }
        guard.disarm();

        info!("BIG {}: synchronizing to {} BIS", big.index(), members.len());
        Ok(big)
    }

    /// Terminate a broadcast BIG, or stop receiving a synchronized one.
    /// Broadcasting channels are released by [`Iso::big_terminated`];
    /// receiving channels are released immediately.
    pub fn big_terminate(&self, big: BigId) -> Result<(), IsoError> {
        let mut inner = self.inner.borrow_mut();
        let group = inner.bigs.get(big).ok_or(IsoError::UnknownGroup)?;

        match (group.role, group.state) {
            (BigRole::Broadcaster { .. }, BigState::Broadcasting) => {
                self.controller
                    .le_terminate_big(big.index(), ErrorCode::RemoteUserTerminatedConnection)
                    .map_err(IsoError::Controller)?;
                info!("BIG {}: terminating", big.index());
                if let Some(group) = inner.bigs.get_mut(big) {
                    group.state = BigState::TerminatePending;
                }
                inner.set_live_members_state(big, ChanState::Disconnecting);
            }
            (BigRole::Receiver { .. }, BigState::Synced) => {
                self.controller
                    .le_big_terminate_sync(big.index())
                    .map_err(IsoError::Controller)?;
                self.big_release(&mut inner, big, ErrorCode::ConnectionTerminatedByLocalHost);
            }
            (_, state) => {
                info!("BIG {} cannot be terminated in {:?} state", big.index(), state);
                return Err(IsoError::Busy);
            }
        }

        drop(inner);
        self.flush();
        Ok(())
    }

    pub fn big_state(&self, big: BigId) -> BigState {
        self.inner.borrow().bigs.get(big).map_or(BigState::Idle, |group| group.state)
    }

    pub fn big_members(&self, big: BigId) -> Result<Vec<ChanId>, IsoError> {
        let inner = self.inner.borrow();
        inner.bigs.get(big).map(|group| group.members.clone()).ok_or(IsoError::UnknownGroup)
    }

    /// HCI LE Create BIG Complete.
    pub fn big_complete(
        &self,
        big_handle: u8,
        status: ErrorCode,
        bis_handles: &[u16],
        params: &BigEstablished,
    ) {
        self.big_established(
            big_handle,
            status,
            bis_handles,
            params,
            (BigState::CreatePending, BigState::Broadcasting),
            ChanKind::Broadcaster,
        )
    }

    /// HCI LE BIG Sync Established.
    pub fn big_sync_established(
        &self,
        big_handle: u8,
        status: ErrorCode,
        bis_handles: &[u16],
        params: &BigEstablished,
    ) {
        self.big_established(
            big_handle,
            status,
            bis_handles,
            params,
            (BigState::SyncPending, BigState::Synced),
            ChanKind::Receiver,
        )
    }

    /// HCI LE Terminate BIG Complete.
    pub fn big_terminated(&self, big_handle: u8, reason: ErrorCode) {
        let mut inner = self.inner.borrow_mut();
        let big = inner.bigs.lookup(big_handle as usize).filter(|big| {
            let role = inner.bigs.get(*big).map(|group| group.role);
            matches!(role, Some(BigRole::Broadcaster { .. }))
        });
        match big {
            Some(big) => self.big_release(&mut inner, big, reason),
            None => warn!("BIG terminated for unknown BIG {}", big_handle),
        }
        drop(inner);
        self.flush();
    }

    /// HCI LE BIG Sync Lost.
    pub fn big_sync_lost(&self, big_handle: u8, reason: ErrorCode) {
        let mut inner = self.inner.borrow_mut();
        let big = inner.bigs.lookup(big_handle as usize).filter(|big| {
            let role = inner.bigs.get(*big).map(|group| group.role);
            matches!(role, Some(BigRole::Receiver { .. }))
        });
        match big {
            Some(big) => self.big_release(&mut inner, big, reason),
            None => warn!("BIG sync lost for unknown BIG {}", big_handle),
        }
        drop(inner);
        self.flush();
    }

    /// HCI LE Periodic Advertising Sync Established.
    pub fn per_sync_established(&self, sync_handle: u16) {
        debug!("periodic sync 0x{:x} established", sync_handle);
        self.inner.borrow_mut().per_syncs.insert(sync_handle);
    }

    /// HCI LE Periodic Advertising Sync Lost. Synchronized BIGs are not
    /// affected.
    pub fn per_sync_lost(&self, sync_handle: u16) {
        debug!("periodic sync 0x{:x} lost", sync_handle);
        self.inner.borrow_mut().per_syncs.remove(&sync_handle);
    }

    fn big_established(
        &self,
        big_handle: u8,
        status: ErrorCode,
        bis_handles: &[u16],
        params: &BigEstablished,
        (pending, established): (BigState, BigState),
        kind: ChanKind,
    ) {
        let mut inner = self.inner.borrow_mut();

        let big = inner.bigs.lookup(big_handle as usize).filter(|big| {
            inner.bigs.get(*big).map(|group| group.state) == Some(pending)
        });
        let Some(big) = big else {
            warn!("{:?} completion for BIG {} matches no procedure", pending, big_handle);
            // The handle cannot be trusted: fail the group waiting for this
            // completion, if any.
            if let Some(big) = inner.bigs.find(|group| group.state == pending) {
                self.big_release(&mut inner, big, ErrorCode::UnspecifiedError);
            }
            drop(inner);
            self.flush();
            return;
        };

        let Some(group) = inner.bigs.get_mut(big) else {
            return;
        };
        if !status.is_success() || bis_handles.len() != group.members.len() {
            warn!(
                "BIG {}: establishment failed ({:?}, {} handles for {} BIS)",
                big_handle,
                status,
                bis_handles.len(),
                group.members.len()
            );
            let reason = if status.is_success() { ErrorCode::UnspecifiedError } else { status };
            self.big_release(&mut inner, big, reason);
        } else {
            info!("BIG {}: {:?} -> {:?}", big_handle, group.state, established);
            group.state = established;
            let members = group.members.clone();
            for (id, handle) in members.iter().zip(bis_handles) {
                if let Some(chan) = inner.chans.get_mut(*id) {
                    chan.conn = Some(IsoConn::new(*handle, kind));
                }
            }
            for id in members {
                // A data path failure terminates the whole group.
                if inner.bigs.get(big).map(|group| group.state) != Some(established) {
                    break;
                }
                self.chan_established(&mut inner, id, Established::Big(params.clone()));
            }
        }

        drop(inner);
        self.flush();
    }

    /// Force the termination of a BIG after a fatal stream failure.
    pub(crate) fn big_abort(&self, inner: &mut Inner, big: BigId, reason: ErrorCode) {
        let Some(group) = inner.bigs.get(big) else {
            return;
        };
        match group.role {
            BigRole::Broadcaster { .. } => {
                match self
                    .controller
                    .le_terminate_big(big.index(), ErrorCode::ConnectionTerminatedByLocalHost)
                {
                    Ok(()) => {
                        info!("BIG {}: aborting", big.index());
                        if let Some(group) = inner.bigs.get_mut(big) {
                            group.state = BigState::TerminatePending;
                        }
                        inner.set_live_members_state(big, ChanState::Disconnecting);
                    }
                    Err(status) => {
                        warn!("BIG {}: terminate failed ({:?})", big.index(), status);
                        self.big_release(inner, big, reason);
                    }
                }
            }
            BigRole::Receiver { .. } => {
                if let Err(status) = self.controller.le_big_terminate_sync(big.index()) {
                    warn!("BIG {}: terminate sync failed ({:?})", big.index(), status);
                }
                self.big_release(inner, big, reason);
            }
        }
    }

    /// Disconnect and unbind every member, then release the BIG slot.
    fn big_release(&self, inner: &mut Inner, big: BigId, reason: ErrorCode) {
        let Some(group) = inner.bigs.remove(big) else {
            return;
        };
        for id in group.members {
            self.chan_disconnected(inner, id, reason);
            if let Some(chan) = inner.chans.get_mut(id) {
                chan.group = None;
                chan.conn = None;
            }
        }
        info!("BIG {} released ({:?})", big.index(), reason);
    }
}
