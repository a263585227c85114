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

//! Isochronous channels core.
//!
//! The core is driven from a single thread of control: application calls
//! and controller events both enter through [`Iso`]. State is held in
//! cells and channel callbacks are queued while it is borrowed, then
//! dispatched once every borrow is released, so callbacks may call back
//! into [`Iso`].

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use crate::hci::{Controller, ErrorCode, Role, SecurityLevel};
use crate::packets::PacketError;

mod arena;
pub mod big;
mod buf;
pub mod chan;
pub mod cig;
pub mod config;
pub mod qos;
mod recv;
mod security;
pub mod server;

#[cfg(test)]
pub(crate) mod test;

pub use arena::Handle;
pub use big::{Big, BigId, BigState};
pub use chan::{Chan, ChanId, ChanInfo, ChanKind, ChanOps, ChanState, RecvFlags, RecvInfo};
pub use cig::{Cig, CigId, CigState};
pub use config::{IsoConfig, PoolConfig};
pub use qos::{BigSyncTiming, BigTiming, CigTiming, Framing, IoQos, Packing, Qos};
pub use security::ConnectParam;
pub use server::{AcceptInfo, IsoServer};

use arena::Arena;
use buf::BufPool;
use chan::GroupRef;
use qos::QosUse;
use recv::Reassembly;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IsoError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("Invalid QoS: {0}")]
    InvalidQos(&'static str),
    #[error("Invalid parameters: {0}")]
    InvalidParameters(&'static str),
    #[error("Unknown channel")]
    InvalidChannel,
    #[error("Channel already bound to a group")]
    AlreadyBound,
    #[error("Channel not bound")]
    NotBound,
    #[error("Channel listed more than once")]
    DuplicateChannel,
    #[error("Too many channels for the group")]
    TooManyChannels,
    #[error("Unknown group")]
    UnknownGroup,
    #[error("Unknown ACL connection")]
    UnknownLink,
    #[error("Periodic advertising sync not established")]
    NotSynchronized,
    #[error("No free group slot")]
    NoFreeGroup,
    #[error("No free channel slot")]
    NoFreeChannel,
    #[error("No buffers available")]
    NoBuffers,
    #[error("Operation not permitted in the current state")]
    InvalidState,
    #[error("Operation already in progress")]
    Busy,
    #[error("Controller rejected the command: {0:?}")]
    Controller(ErrorCode),
    #[error("Malformed ISO packet: {0}")]
    Packet(#[from] PacketError),
    #[error("Payload of {0} bytes exceeds the maximum SDU size")]
    PayloadTooLarge(usize),
    #[error("Operation not supported for this channel")]
    NotSupported,
}

/// ACL connection known to the core.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Acl {
    pub role: Role,
    pub security: SecurityLevel,
}

pub(crate) struct Inner {
    pub chans: Arena<Chan>,
    pub cigs: Arena<Cig>,
    pub bigs: Arena<Big>,
    pub acls: HashMap<u16, Acl>,
    /// ACL connections with a security procedure in progress.
    pub security_pending: HashSet<u16>,
    /// Established periodic advertising syncs.
    pub per_syncs: HashSet<u16>,
    /// In progress inbound SDUs, keyed by connection handle.
    pub rx: HashMap<u16, Reassembly>,
}

impl Inner {
    /// Live channel using the connection handle `handle`.
    pub fn chan_by_handle(&self, handle: u16) -> Option<ChanId> {
        self.chans.find(|chan| chan.conn.as_ref().map(|conn| conn.handle) == Some(handle))
    }

    /// Check that `members` can be added to a new or existing group.
    pub fn check_members(
        &self,
        members: &[ChanId],
        max: usize,
        usage: QosUse,
    ) -> Result<(), IsoError> {
        if members.is_empty() {
            return Err(IsoError::InvalidParameters("no channels"));
        }
        if members.len() > max {
            return Err(IsoError::TooManyChannels);
        }
        for (index, id) in members.iter().enumerate() {
            if members[..index].contains(id) {
                return Err(IsoError::DuplicateChannel);
            }
            let chan = self.chans.get(*id).ok_or(IsoError::InvalidChannel)?;
            if chan.group.is_some() {
                return Err(IsoError::AlreadyBound);
            }
            if chan.state != ChanState::Disconnected || chan.conn.is_some() {
                return Err(IsoError::InvalidState);
            }
            chan.qos.as_ref().ok_or(IsoError::InvalidQos("QoS not set"))?.validate(usage)?;
        }
        Ok(())
    }
}

/// Group slot released together with the bindings.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Slot {
    Cig(CigId),
    Big(BigId),
}

/// Channels bound to a group while the group is being set up. Unless
/// disarmed, dropping the guard unbinds them and releases the slot.
pub(crate) struct BindGuard<'a> {
    inner: &'a mut Inner,
    slot: Option<Slot>,
    bound: Vec<ChanId>,
}

impl<'a> BindGuard<'a> {
    pub fn new(inner: &'a mut Inner, slot: Option<Slot>) -> Self {
        BindGuard { inner, slot, bound: vec![] }
    }

    pub fn bind(&mut self, id: ChanId, group: GroupRef) {
        if let Some(chan) = self.inner.chans.get_mut(id) {
            chan.group = Some(group);
            self.bound.push(id);
        }
    }

    pub fn disarm(mut self) {
        self.slot = None;
        self.bound.clear();
    }
}

impl Deref for BindGuard<'_> {
    type Target = Inner;

    fn deref(&self) -> &Inner {
        self.inner
    }
}

impl DerefMut for BindGuard<'_> {
    fn deref_mut(&mut self) -> &mut Inner {
        self.inner
    }
}

impl Drop for BindGuard<'_> {
    fn drop(&mut self) {
        for id in self.bound.drain(..) {
            if let Some(chan) = self.inner.chans.get_mut(id) {
                debug!("{:?}: binding rolled back", id);
                chan.group = None;
                chan.conn = None;
                chan.state = ChanState::Disconnected;
            }
        }
        match self.slot.take() {
            Some(Slot::Cig(cig)) => drop(self.inner.cigs.remove(cig)),
            Some(Slot::Big(big)) => drop(self.inner.bigs.remove(big)),
            None => (),
        }
    }
}

/// Channel callback waiting to be dispatched.
enum Notify {
    Connected(Rc<dyn ChanOps>, ChanId),
    Disconnected(Rc<dyn ChanOps>, ChanId, ErrorCode),
    Recv(Rc<dyn ChanOps>, ChanId, RecvInfo, Bytes),
    Sent(Rc<dyn ChanOps>, ChanId),
}

pub struct Iso {
    controller: Rc<dyn Controller>,
    config: IsoConfig,
    inner: RefCell<Inner>,
    server: RefCell<Option<Rc<dyn IsoServer>>>,
    pending: RefCell<VecDeque<Notify>>,
    rx_pool: BufPool,
    tx_pool: BufPool,
}

impl Iso {
    pub fn new(controller: Rc<dyn Controller>, config: IsoConfig) -> Result<Iso, IsoError> {
        config.validate()?;
        Ok(Iso {
            controller,
            inner: RefCell::new(Inner {
                chans: Arena::with_capacity(config.max_chan),
                cigs: Arena::with_capacity(config.max_cig),
                bigs: Arena::with_capacity(config.max_big),
                acls: HashMap::new(),
                security_pending: HashSet::new(),
                per_syncs: HashSet::new(),
                rx: HashMap::new(),
            }),
            server: RefCell::new(None),
            pending: RefCell::new(VecDeque::new()),
            rx_pool: BufPool::new("rx", config.rx_pool),
            tx_pool: BufPool::new("tx", config.tx_pool),
            config,
        })
    }

    pub fn config(&self) -> &IsoConfig {
        &self.config
    }

    /// Number of free buffers in the inbound and outbound pools.
    pub fn available_buffers(&self) -> (usize, usize) {
        (self.rx_pool.available(), self.tx_pool.available())
    }

    fn notify(&self, notification: Notify) {
        self.pending.borrow_mut().push_back(notification);
    }

    /// Dispatch queued callbacks. Must be called with `inner` released.
    fn flush(&self) {
        loop {
            let notification = self.pending.borrow_mut().pop_front();
            match notification {
                Some(Notify::Connected(ops, chan)) => {
                    trace!("{:?}: connected callback", chan);
                    ops.connected(chan)
                }
                Some(Notify::Disconnected(ops, chan, reason)) => {
                    trace!("{:?}: disconnected callback ({:?})", chan, reason);
                    ops.disconnected(chan, reason)
                }
                Some(Notify::Recv(ops, chan, info, data)) => ops.recv(chan, &info, data),
                Some(Notify::Sent(ops, chan)) => ops.sent(chan),
                None => break,
            }
        }
    }
}
