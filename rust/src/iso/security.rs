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

//! ACL connections and the central connect procedure.
//!
//! A CIS can only be created once its ACL connection has the security
//! level required by the channel. Channels waiting for a security
//! procedure are parked in EncryptPending, and the CIS of every channel
//! parked on a link are created together when the procedure completes.

use tracing::{debug, info, warn};

use crate::hci::{CreateCisConfig, ErrorCode, Role, SecurityLevel};
use crate::iso::chan::{ChanId, ChanState, GroupRef};
use crate::iso::cig::{CigId, CigState};
use crate::iso::{Acl, Inner, Iso, IsoError};

/// One CIS to create: the channel and the ACL connection it goes over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectParam {
    pub acl: u16,
    pub chan: ChanId,
}

impl Inner {
    /// Channels waiting for a security procedure on `acl`.
    fn parked(&self, acl: u16) -> Vec<ChanId> {
        self.chans
            .iter()
            .filter(|(_, chan)| chan.state == ChanState::EncryptPending && chan.acl == Some(acl))
            .map(|(id, _)| id)
            .collect()
    }

    fn check_connect(&self, param: &ConnectParam) -> Result<CigId, IsoError> {
        let chan = self.chans.get(param.chan).ok_or(IsoError::InvalidChannel)?;
        if chan.state != ChanState::Disconnected {
            return Err(IsoError::InvalidState);
        }
        let Some(GroupRef::Cig(cig, _)) = chan.group else {
            return Err(IsoError::NotBound);
        };
        if chan.conn.is_none() {
            return Err(IsoError::NotBound);
        }
        let group = self.cigs.get(cig).ok_or(IsoError::UnknownGroup)?;
        if !matches!(group.state, CigState::Configured | CigState::Active) {
            return Err(IsoError::InvalidState);
        }
        let acl = self.acls.get(&param.acl).ok_or(IsoError::UnknownLink)?;
        if acl.role != Role::Central {
            return Err(IsoError::NotSupported);
        }
        Ok(cig)
    }

    fn create_cis_config(&self, id: ChanId) -> Option<CreateCisConfig> {
        let chan = self.chans.get(id)?;
        Some(CreateCisConfig {
            cis_connection_handle: chan.conn.as_ref()?.handle,
            acl_connection_handle: chan.acl?,
        })
    }
}

impl Iso {
    /// HCI Connection Complete for an LE ACL connection.
    pub fn acl_connected(&self, handle: u16, role: Role, security: SecurityLevel) {
        info!("ACL 0x{:x} connected as {:?} ({:?})", handle, role, security);
        self.inner.borrow_mut().acls.insert(handle, Acl { role, security });
    }

    /// The ACL connection `handle` is gone. Channels waiting on its
    /// security fail with `reason`.
    pub fn acl_disconnected(&self, handle: u16, reason: ErrorCode) {
        let mut inner = self.inner.borrow_mut();
        self.acl_lost(&mut inner, handle, reason);
        drop(inner);
        self.flush();
    }

    pub(crate) fn acl_lost(&self, inner: &mut Inner, handle: u16, reason: ErrorCode) {
        if inner.acls.remove(&handle).is_none() {
            debug!("disconnection of unknown ACL 0x{:x}", handle);
            return;
        }
        info!("ACL 0x{:x} disconnected ({:?})", handle, reason);
        inner.security_pending.remove(&handle);
        for id in inner.parked(handle) {
            self.chan_disconnected(inner, id, reason);
        }
    }

    /// Connect the CIS of `params`, each over its ACL connection.
    ///
    /// The CIS of channels whose ACL connection is secure enough are
    /// created with a single LE Create CIS. The other channels wait in
    /// EncryptPending while the security of their link is raised, with one
    /// request per link, and are connected by [`Iso::security_changed`].
    pub fn connect(&self, params: &[ConnectParam]) -> Result<(), IsoError> {
        if params.is_empty() {
            return Err(IsoError::InvalidParameters("no channels"));
        }
        let mut inner = self.inner.borrow_mut();

        let mut groups = vec![];
        for (index, param) in params.iter().enumerate() {
            if params[..index].iter().any(|other| other.chan == param.chan) {
                return Err(IsoError::DuplicateChannel);
            }
            let cig = inner.check_connect(param)?;
            if !groups.contains(&cig) {
                groups.push(cig);
            }
        }

        // Highest level required on each link that is not secure enough.
        let mut upgrades: Vec<(u16, SecurityLevel)> = vec![];
        let mut parked = vec![false; params.len()];
        for (index, param) in params.iter().enumerate() {
            let required = inner
                .chans
                .get(param.chan)
                .map_or(SecurityLevel::L1, |chan| chan.required_security);
            let current =
                inner.acls.get(&param.acl).map_or(SecurityLevel::L1, |acl| acl.security);
            if required <= current {
                continue;
            }
            parked[index] = true;
            match upgrades.iter_mut().find(|(acl, _)| *acl == param.acl) {
                Some((_, level)) => *level = (*level).max(required),
                None => upgrades.push((param.acl, required)),
            }
        }

        for (acl, level) in upgrades {
            if inner.security_pending.contains(&acl) {
                debug!("ACL 0x{:x}: security procedure already in progress", acl);
                continue;
            }
            self.controller.set_security(acl, level).map_err(|status| {
                warn!("ACL 0x{:x}: security request failed ({:?})", acl, status);
                IsoError::Controller(status)
            })?;
            info!("ACL 0x{:x}: raising security to {:?}", acl, level);
            inner.security_pending.insert(acl);
        }

        let mut previous = Vec::with_capacity(params.len());
        let mut cis = vec![];
        for (param, parked) in params.iter().zip(parked) {
            let Some(chan) = inner.chans.get_mut(param.chan) else {
                continue;
            };
            previous.push((param.chan, chan.acl));
            chan.acl = Some(param.acl);
            chan.state = if parked { ChanState::EncryptPending } else { ChanState::Connecting };
            if !parked {
                cis.extend(inner.create_cis_config(param.chan));
            }
        }

        if !cis.is_empty() {
            if let Err(status) = self.controller.le_create_cis(&cis) {
                warn!("LE Create CIS failed ({:?})", status);
                for (id, acl) in previous {
                    if let Some(chan) = inner.chans.get_mut(id) {
                        chan.acl = acl;
                        chan.state = ChanState::Disconnected;
                    }
                }
                return Err(IsoError::Controller(status));
            }
            info!("creating {} CIS", cis.len());
        }

        for cig in groups {
            self.cig_activate(&mut inner, cig);
        }
        Ok(())
    }

    /// Connect one channel over the ACL connection it is bound to.
    pub fn chan_connect(&self, id: ChanId) -> Result<(), IsoError> {
        let acl = {
            let inner = self.inner.borrow();
            let chan = inner.chans.get(id).ok_or(IsoError::InvalidChannel)?;
            chan.acl.ok_or(IsoError::NotBound)?
        };
        self.connect(&[ConnectParam { acl, chan: id }])
    }

    /// HCI Encryption Change, or the completion of a pairing procedure,
    /// on the ACL connection `handle`.
    pub fn security_changed(&self, handle: u16, status: ErrorCode, level: SecurityLevel) {
        let mut inner = self.inner.borrow_mut();
        inner.security_pending.remove(&handle);
        let current = match inner.acls.get_mut(&handle) {
            Some(acl) if status.is_success() => {
                info!("ACL 0x{:x}: security {:?} -> {:?}", handle, acl.security, level);
                acl.security = level;
                Some(level)
            }
            Some(acl) => {
                warn!("ACL 0x{:x}: security procedure failed ({:?})", handle, status);
                Some(acl.security)
            }
            None => None,
        };

        let parked = inner.parked(handle);
        match current {
            _ if parked.is_empty() => (),
            None => {
                warn!("security change on unknown ACL 0x{:x}", handle);
                for id in parked {
                    self.chan_disconnected(&mut inner, id, ErrorCode::UnknownConnection);
                }
            }
            Some(_) if !status.is_success() => {
                for id in parked {
                    self.chan_disconnected(&mut inner, id, status);
                }
            }
            Some(level) => {
                let mut connecting = vec![];
                for id in parked {
                    let Some(chan) = inner.chans.get_mut(id) else {
                        continue;
                    };
                    if chan.required_security <= level {
                        chan.state = ChanState::Connecting;
                        connecting.push(id);
                    } else {
                        info!("{:?}: requires {:?}", id, chan.required_security);
                        self.chan_disconnected(&mut inner, id, ErrorCode::InsufficientSecurity);
                    }
                }

                let cis: Vec<_> =
                    connecting.iter().filter_map(|id| inner.create_cis_config(*id)).collect();
                if !cis.is_empty() {
                    match self.controller.le_create_cis(&cis) {
                        Ok(()) => info!("ACL 0x{:x}: creating {} CIS", handle, cis.len()),
                        Err(status) => {
                            warn!("LE Create CIS failed ({:?})", status);
                            for id in connecting {
                                self.chan_disconnected(&mut inner, id, status);
                            }
                        }
                    }
                }
            }
        }

        drop(inner);
        self.flush();
    }
}
