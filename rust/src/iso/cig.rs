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

//! Connected Isochronous Groups, central side.
//!
//! A CIG is configured in the controller with HCI LE Set CIG Parameters
//! before any of its CIS can be created, and removed with HCI LE Remove
//! CIG once none of them is connected.

use tracing::{info, warn};

use crate::hci::{CigParameters, CisParametersConfig, ErrorCode, PHY_LE_2M};
use crate::iso::chan::{ChanId, ChanKind, ChanState, GroupRef, IsoConn};
use crate::iso::qos::{CigTiming, IoQos, Qos, QosUse};
use crate::iso::{BindGuard, Handle, Inner, Iso, IsoError, Slot};

/// CIG handle; the slot index is the CIG_ID.
pub type CigId = Handle<Cig>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CigState {
    /// Not allocated.
    Idle,
    /// Configured in the controller, no CIS created yet.
    Configured,
    /// At least one CIS is establishing or established.
    Active,
    /// Every CIS has been disconnected.
    Inactive,
}

pub struct Cig {
    pub(crate) state: CigState,
    pub(crate) timing: CigTiming,
    /// Members in CIS_ID order.
    pub(crate) members: Vec<ChanId>,
}

fn phy_and_rtn(io: Option<&IoQos>, fallback: Option<&IoQos>) -> (u8, u8) {
    io.or(fallback).map_or((PHY_LE_2M, 0), |io| (io.phy, io.rtn))
}

/// CIS entry of LE Set CIG Parameters, from the central point of view.
/// An unused direction borrows the PHY and RTN of the other one.
fn cis_parameters(cis_id: u8, qos: &Qos) -> CisParametersConfig {
    let tx = qos.tx.as_ref();
    let rx = qos.rx.as_ref();
    let (phy_c_to_p, rtn_c_to_p) = phy_and_rtn(tx, rx);
    let (phy_p_to_c, rtn_p_to_c) = phy_and_rtn(rx, tx);

    CisParametersConfig {
        cis_id,
        max_sdu_c_to_p: tx.map_or(0, |io| io.sdu),
        max_sdu_p_to_c: rx.map_or(0, |io| io.sdu),
        phy_c_to_p,
        phy_p_to_c,
        rtn_c_to_p,
        rtn_p_to_c,
    }
}

impl Inner {
    fn cig_parameters(&self, cig: CigId, timing: &CigTiming, members: &[ChanId]) -> CigParameters {
        let cis_config = members
            .iter()
            .filter_map(|id| self.chans.get(*id))
            .filter_map(|chan| match (chan.group, chan.qos.as_ref()) {
                (Some(GroupRef::Cig(_, cis_id)), Some(qos)) => Some(cis_parameters(cis_id, qos)),
                _ => None,
            })
            .collect();

        CigParameters {
            cig_id: cig.index(),
            sdu_interval_c_to_p: timing.interval,
            sdu_interval_p_to_c: timing.interval,
            worst_case_sca: timing.sca,
            packing: timing.packing as u8,
            framing: timing.framing as u8,
            max_transport_latency_c_to_p: timing.latency,
            max_transport_latency_p_to_c: timing.latency,
            cis_config,
        }
    }

    /// Record the CIS connection handles assigned by the controller.
    fn assign_cis_handles(&mut self, members: &[ChanId], handles: Vec<u16>) {
        for (id, handle) in members.iter().zip(handles) {
            if let Some(chan) = self.chans.get_mut(*id) {
                match chan.conn.as_mut() {
                    Some(conn) => conn.handle = handle,
                    None => chan.conn = Some(IsoConn::new(handle, ChanKind::Central)),
                }
            }
        }
    }
}

impl Iso {
    /// Configure a new CIG with one CIS per channel. The channels are
    /// given CIS_IDs in order and stay disconnected.
    pub fn cig_create(&self, members: &[ChanId], timing: CigTiming) -> Result<CigId, IsoError> {
        timing.validate()?;
        let mut inner = self.inner.borrow_mut();
        inner.check_members(members, self.config.max_cis_per_cig, QosUse::Unicast)?;

        let cig = inner
            .cigs
            .insert_with(|_| Cig {
                state: CigState::Configured,
                timing: timing.clone(),
                members: vec![],
            })
            .ok_or(IsoError::NoFreeGroup)?;

        let mut guard = BindGuard::new(&mut inner, Some(Slot::Cig(cig)));
        for (cis_id, id) in members.iter().enumerate() {
            guard.bind(*id, GroupRef::Cig(cig, cis_id as u8));
        }

        let parameters = guard.cig_parameters(cig, &timing, members);
        let handles = self.controller.le_set_cig_parameters(&parameters).map_err(|status| {
            warn!("CIG {} configuration failed ({:?})", cig.index(), status);
            IsoError::Controller(status)
        })?;
        if handles.len() != members.len() {
            warn!(
                "CIG {}: {} connection handles for {} CIS",
                cig.index(),
                handles.len(),
                members.len()
            );
            if let Err(status) = self.controller.le_remove_cig(cig.index()) {
                warn!("CIG {} removal failed ({:?})", cig.index(), status);
            }
            return Err(IsoError::Controller(ErrorCode::UnspecifiedError));
        }

        guard.assign_cis_handles(members, handles);
        if let Some(group) = guard.cigs.get_mut(cig) {
            group.members = members.to_vec();
        }
        guard.disarm();

        info!("CIG {} configured with {} CIS", cig.index(), members.len());
        Ok(cig)
    }

    /// Add channels to a configured CIG and update its timing. A failure
    /// only undoes the channels added by this call.
    pub fn cig_reconfigure(
        &self,
        cig: CigId,
        members: &[ChanId],
        timing: CigTiming,
    ) -> Result<(), IsoError> {
        timing.validate()?;
        let mut inner = self.inner.borrow_mut();
        let group = inner.cigs.get(cig).ok_or(IsoError::UnknownGroup)?;
        if group.state != CigState::Configured {
            info!("CIG {} is no longer in the configurable state", cig.index());
            return Err(IsoError::InvalidState);
        }
        let existing = group.members.clone();
        let max = self.config.max_cis_per_cig;
        if existing.len() + members.len() > max {
            return Err(IsoError::TooManyChannels);
        }
        if !members.is_empty() {
            inner.check_members(members, max, QosUse::Unicast)?;
        }

        let mut guard = BindGuard::new(&mut inner, None);
        for (index, id) in members.iter().enumerate() {
            guard.bind(*id, GroupRef::Cig(cig, (existing.len() + index) as u8));
        }

        let all: Vec<ChanId> = existing.iter().chain(members).copied().collect();
        let parameters = guard.cig_parameters(cig, &timing, &all);
        let handles = self.controller.le_set_cig_parameters(&parameters).map_err(|status| {
            warn!("CIG {} reconfiguration failed ({:?})", cig.index(), status);
            IsoError::Controller(status)
        })?;
        if handles.len() != all.len() {
            warn!(
                "CIG {}: {} connection handles for {} CIS",
                cig.index(),
                handles.len(),
                all.len()
            );
            return Err(IsoError::Controller(ErrorCode::UnspecifiedError));
        }

        guard.assign_cis_handles(&all, handles);
        if let Some(group) = guard.cigs.get_mut(cig) {
            group.members = all;
            group.timing = timing;
        }
        guard.disarm();

        info!("CIG {} reconfigured, {} new CIS", cig.index(), members.len());
        Ok(())
    }

    /// Remove a CIG with no connected CIS and unbind its channels.
    pub fn cig_terminate(&self, cig: CigId) -> Result<(), IsoError> {
        let mut inner = self.inner.borrow_mut();
        let group = inner.cigs.get(cig).ok_or(IsoError::UnknownGroup)?;
        if !matches!(group.state, CigState::Configured | CigState::Inactive) {
            info!("CIG {} cannot be removed as it is in {:?} state", cig.index(), group.state);
            return Err(IsoError::InvalidState);
        }

        self.controller.le_remove_cig(cig.index()).map_err(IsoError::Controller)?;

        let members = inner.cigs.remove(cig).map(|group| group.members).unwrap_or_default();
        for id in members {
            if let Some(chan) = inner.chans.get_mut(id) {
                chan.group = None;
                chan.conn = None;
            }
        }
        info!("CIG {} removed", cig.index());
        Ok(())
    }

    pub fn cig_state(&self, cig: CigId) -> CigState {
        self.inner.borrow().cigs.get(cig).map_or(CigState::Idle, |group| group.state)
    }

    pub fn cig_timing(&self, cig: CigId) -> Result<CigTiming, IsoError> {
        let inner = self.inner.borrow();
        inner.cigs.get(cig).map(|group| group.timing.clone()).ok_or(IsoError::UnknownGroup)
    }

    pub fn cig_members(&self, cig: CigId) -> Result<Vec<ChanId>, IsoError> {
        let inner = self.inner.borrow();
        inner.cigs.get(cig).map(|group| group.members.clone()).ok_or(IsoError::UnknownGroup)
    }

    /// A create connection request covering members of the CIG has been
    /// accepted.
    pub(crate) fn cig_activate(&self, inner: &mut Inner, cig: CigId) {
        if let Some(group) = inner.cigs.get_mut(cig) {
            if group.state != CigState::Active {
                info!("CIG {}: {:?} -> Active", cig.index(), group.state);
                group.state = CigState::Active;
            }
        }
    }

    /// Move an active CIG with no live member left to Inactive.
    pub(crate) fn cig_update_state(&self, inner: &mut Inner, cig: CigId) {
        let Some(group) = inner.cigs.get(cig) else {
            return;
        };
        let live = group.members.iter().any(|id| {
            inner.chans.get(*id).map_or(false, |chan| chan.state != ChanState::Disconnected)
        });
        if group.state == CigState::Active && !live {
            info!("CIG {}: Active -> Inactive", cig.index());
            if let Some(group) = inner.cigs.get_mut(cig) {
                group.state = CigState::Inactive;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::SecurityLevel;
    use crate::iso::qos::Framing;
    use crate::iso::test::{cig_timing, io_qos, Command, Op, TestContext, ACL_HANDLE};
    use crate::iso::IsoConfig;

    #[test]
    fn create_two_members() {
        let ctx = TestContext::new();
        let (ch1, _) = ctx.chan();
        let (ch2, _) = ctx.chan();

        let cig = ctx.iso.cig_create(&[ch1, ch2], cig_timing()).unwrap();
        assert_eq!(ctx.iso.cig_state(cig), CigState::Configured);
        assert_eq!(ctx.iso.cig_members(cig), Ok(vec![ch1, ch2]));
        assert_eq!(ctx.iso.chan_state(ch1), Ok(ChanState::Disconnected));
        assert_eq!(ctx.iso.chan_state(ch2), Ok(ChanState::Disconnected));
        assert_eq!(ctx.iso.chan_info(ch1).unwrap().cig, Some((0, 0)));
        assert_eq!(ctx.iso.chan_info(ch2).unwrap().cig, Some((0, 1)));

        let commands = ctx.controller.take();
        let [Command::SetCigParameters(parameters)] = commands.as_slice() else {
            panic!("unexpected commands {:?}", commands);
        };
        assert_eq!(parameters.cig_id, 0);
        assert_eq!(parameters.sdu_interval_c_to_p, 10_000);
        assert_eq!(parameters.max_transport_latency_p_to_c, 10);
        assert_eq!(parameters.cis_config.len(), 2);
        assert_eq!(parameters.cis_config[1].cis_id, 1);
        assert_eq!(parameters.cis_config[1].max_sdu_c_to_p, 400);

        let handles: Vec<_> =
            [ch1, ch2].iter().map(|id| ctx.iso.chan_info(*id).unwrap().handle).collect();
        assert_eq!(handles, vec![Some(0xe00), Some(0xe01)]);
    }

    #[test]
    fn unused_direction_parameters() {
        let qos = Qos { tx: None, rx: Some(IoQos { phy: 0x1, rtn: 3, ..io_qos(100) }) };
        let cis = cis_parameters(2, &qos);
        assert_eq!(cis.max_sdu_c_to_p, 0);
        assert_eq!(cis.max_sdu_p_to_c, 100);
        assert_eq!((cis.phy_c_to_p, cis.phy_p_to_c), (0x1, 0x1));
        assert_eq!((cis.rtn_c_to_p, cis.rtn_p_to_c), (3, 3));
    }

    #[test]
    fn invalid_creation_has_no_side_effect() {
        let ctx = TestContext::new();
        let (ch1, _) = ctx.chan();
        let (ch2, _) = ctx.chan();

        assert_eq!(ctx.iso.cig_create(&[ch1, ch1], cig_timing()), Err(IsoError::DuplicateChannel));
        assert!(ctx.iso.cig_create(&[], cig_timing()).is_err());
        assert!(matches!(
            ctx.iso.cig_create(&[ch1], CigTiming { interval: 0x10, ..cig_timing() }),
            Err(IsoError::InvalidParameters(_))
        ));

        let (no_qos, _) = ctx.chan_without_qos();
        assert!(matches!(
            ctx.iso.cig_create(&[ch1, no_qos], cig_timing()),
            Err(IsoError::InvalidQos(_))
        ));
        let too_many: Vec<_> = (0..5).map(|_| ctx.chan().0).collect();
        assert_eq!(ctx.iso.cig_create(&too_many, cig_timing()), Err(IsoError::TooManyChannels));

        assert!(ctx.controller.take().is_empty());
        assert_eq!(ctx.iso.chan_info(ch1).unwrap().cig, None);

        let cig = ctx.iso.cig_create(&[ch1], cig_timing()).unwrap();
        assert_eq!(cig.index(), 0);
        assert_eq!(ctx.iso.cig_create(&[ch1, ch2], cig_timing()), Err(IsoError::AlreadyBound));
        assert_eq!(ctx.iso.chan_info(ch2).unwrap().cig, None);
    }

    #[test]
    fn controller_failure_rolls_back() {
        let ctx = TestContext::new();
        let (ch1, _) = ctx.chan();
        let (ch2, _) = ctx.chan();

        ctx.controller.fail(Op::SetCigParameters, ErrorCode::MemoryCapacityExceeded);
        assert_eq!(
            ctx.iso.cig_create(&[ch1, ch2], cig_timing()),
            Err(IsoError::Controller(ErrorCode::MemoryCapacityExceeded))
        );
        assert_eq!(ctx.iso.chan_info(ch1).unwrap().cig, None);
        assert_eq!(ctx.iso.chan_info(ch2).unwrap().handle, None);

        ctx.controller.withhold_handles(1);
        assert_eq!(
            ctx.iso.cig_create(&[ch1, ch2], cig_timing()),
            Err(IsoError::Controller(ErrorCode::UnspecifiedError))
        );
        assert_eq!(ctx.controller.take().last(), Some(&Command::RemoveCig(0)));
        assert_eq!(ctx.iso.chan_info(ch1).unwrap().cig, None);

        // The slot was released.
        let cig = ctx.iso.cig_create(&[ch1, ch2], cig_timing()).unwrap();
        assert_eq!(cig.index(), 0);
    }

    #[test]
    fn no_free_group() {
        let ctx = TestContext::with_config(IsoConfig::default().with_max_cig(1, 4));
        let (ch1, _) = ctx.chan();
        let (ch2, _) = ctx.chan();
        ctx.iso.cig_create(&[ch1], cig_timing()).unwrap();
        assert_eq!(ctx.iso.cig_create(&[ch2], cig_timing()), Err(IsoError::NoFreeGroup));
        assert_eq!(ctx.iso.chan_info(ch2).unwrap().cig, None);
    }

    #[test]
    fn reconfigure() {
        let ctx = TestContext::new();
        let (ch1, _) = ctx.chan();
        let (ch2, _) = ctx.chan();
        let (ch3, _) = ctx.chan();
        let (cig, _) = ctx.cig(&[ch1]);

        let timing = CigTiming { framing: Framing::Framed, ..cig_timing() };
        ctx.iso.cig_reconfigure(cig, &[ch2], timing.clone()).unwrap();
        assert_eq!(ctx.iso.cig_members(cig), Ok(vec![ch1, ch2]));
        assert_eq!(ctx.iso.cig_timing(cig), Ok(timing.clone()));
        assert_eq!(ctx.iso.chan_info(ch2).unwrap().cig, Some((0, 1)));
        let commands = ctx.controller.take();
        let [Command::SetCigParameters(parameters)] = commands.as_slice() else {
            panic!("unexpected commands {:?}", commands);
        };
        assert_eq!(parameters.framing, 1);
        assert_eq!(parameters.cis_config.len(), 2);

        // A failure leaves the existing members untouched.
        ctx.controller.fail(Op::SetCigParameters, ErrorCode::InvalidHciCommandParameters);
        assert_eq!(
            ctx.iso.cig_reconfigure(cig, &[ch3], timing),
            Err(IsoError::Controller(ErrorCode::InvalidHciCommandParameters))
        );
        assert_eq!(ctx.iso.cig_members(cig), Ok(vec![ch1, ch2]));
        assert_eq!(ctx.iso.chan_info(ch3).unwrap().cig, None);
        assert_eq!(ctx.iso.chan_info(ch2).unwrap().cig, Some((0, 1)));
        assert_eq!(ctx.iso.cig_state(cig), CigState::Configured);
        assert_eq!(ctx.iso.cig_timing(cig).map(|timing| timing.framing), Ok(Framing::Framed));
    }

    #[test]
    fn reconfigure_requires_configured_state() {
        let ctx = TestContext::new();
        ctx.acl(ACL_HANDLE, SecurityLevel::L2);
        let (ch1, _) = ctx.chan();
        let (ch2, _) = ctx.chan();
        let (cig, _) = ctx.cig(&[ch1]);
        ctx.iso.chan_bind(ch1, ACL_HANDLE).unwrap();
        ctx.iso.chan_connect(ch1).unwrap();
        assert_eq!(ctx.iso.cig_state(cig), CigState::Active);
        assert_eq!(ctx.iso.cig_reconfigure(cig, &[ch2], cig_timing()), Err(IsoError::InvalidState));
        assert_eq!(ctx.iso.cig_terminate(cig), Err(IsoError::InvalidState));
    }

    #[test]
    fn terminate_is_not_repeatable() {
        let ctx = TestContext::new();
        let (ch1, _) = ctx.chan();
        let (ch2, _) = ctx.chan();
        let (cig, _) = ctx.cig(&[ch1, ch2]);

        assert_eq!(ctx.iso.cig_terminate(cig), Ok(()));
        assert_eq!(ctx.controller.take(), vec![Command::RemoveCig(0)]);
        assert_eq!(ctx.iso.cig_state(cig), CigState::Idle);
        assert_eq!(ctx.iso.chan_info(ch1).unwrap().cig, None);
        assert_eq!(ctx.iso.chan_info(ch1).unwrap().handle, None);

        assert_eq!(ctx.iso.cig_terminate(cig), Err(IsoError::UnknownGroup));
        assert!(ctx.controller.take().is_empty());

        // The identifier is reused, the stale handle is not.
        let (again, _) = ctx.cig(&[ch1]);
        assert_eq!(again.index(), cig.index());
        assert_eq!(ctx.iso.cig_terminate(cig), Err(IsoError::UnknownGroup));
        assert_eq!(ctx.iso.cig_state(again), CigState::Configured);
    }

    #[test]
    fn terminate_failure_keeps_group() {
        let ctx = TestContext::new();
        let (ch1, _) = ctx.chan();
        let (cig, _) = ctx.cig(&[ch1]);
        ctx.controller.fail(Op::RemoveCig, ErrorCode::CommandDisallowed);
        assert_eq!(
            ctx.iso.cig_terminate(cig),
            Err(IsoError::Controller(ErrorCode::CommandDisallowed))
        );
        assert_eq!(ctx.iso.cig_state(cig), CigState::Configured);
        assert_eq!(ctx.iso.chan_info(ch1).unwrap().cig, Some((0, 0)));
    }
}
