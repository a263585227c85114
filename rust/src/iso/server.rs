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

//! Peripheral side: acceptance of incoming CIS requests.

use std::rc::Rc;

use tracing::{info, warn};

use crate::hci::{ErrorCode, Role, SecurityLevel};
use crate::iso::chan::{ChanId, ChanKind, ChanState, IsoConn};
use crate::iso::{Iso, IsoError};

/// Incoming CIS request handed to [`IsoServer::accept`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcceptInfo {
    pub acl: u16,
    pub cig_id: u8,
    pub cis_id: u8,
}

pub trait IsoServer {
    /// Minimum security level of the ACL connection for a request to be
    /// considered.
    fn security_level(&self) -> SecurityLevel {
        SecurityLevel::L1
    }

    /// Pick an unbound, disconnected channel for the request, or the reason
    /// to reject it.
    fn accept(&self, info: &AcceptInfo) -> Result<ChanId, ErrorCode>;
}

impl Iso {
    pub fn register_server(&self, server: Rc<dyn IsoServer>) -> Result<(), IsoError> {
        let mut current = self.server.borrow_mut();
        if current.is_some() {
            return Err(IsoError::Busy);
        }
        *current = Some(server);
        Ok(())
    }

    pub fn unregister_server(&self) -> Result<(), IsoError> {
        self.server.borrow_mut().take().map(|_| ()).ok_or(IsoError::InvalidState)
    }

    /// HCI LE CIS Request.
    pub fn cis_request(&self, acl: u16, cis_handle: u16, cig_id: u8, cis_id: u8) {
        let info = AcceptInfo { acl, cig_id, cis_id };
        if let Err(reason) = self.accept_cis(&info, cis_handle) {
            info!("CIS request 0x{:x} on ACL 0x{:x} rejected ({:?})", cis_handle, acl, reason);
            if let Err(status) = self.controller.le_reject_cis_request(cis_handle, reason) {
                warn!("CIS request 0x{:x}: reject failed ({:?})", cis_handle, status);
            }
        }
        self.flush();
    }

    fn accept_cis(&self, info: &AcceptInfo, cis_handle: u16) -> Result<(), ErrorCode> {
        let server =
            self.server.borrow().clone().ok_or(ErrorCode::UnsupportedFeatureOrParameterValue)?;

        let security = {
            let inner = self.inner.borrow();
            let acl = inner.acls.get(&info.acl).ok_or(ErrorCode::UnknownConnection)?;
            if acl.role != Role::Peripheral {
                return Err(ErrorCode::CommandDisallowed);
            }
            acl.security
        };
        if security < server.security_level() {
            return Err(ErrorCode::InsufficientSecurity);
        }

        // The server is called with no borrow held.
        let id = server.accept(info)?;

        let mut inner = self.inner.borrow_mut();
        let chan = inner.chans.get_mut(id).ok_or(ErrorCode::ConnectionRejectedLimitedResources)?;
        if chan.state != ChanState::Disconnected
            || chan.group.is_some()
            || chan.conn.is_some()
            || chan.qos.is_none()
        {
            warn!("{:?}: cannot take CIS request 0x{:x}", id, cis_handle);
            return Err(ErrorCode::ConnectionRejectedLimitedResources);
        }

        chan.conn = Some(IsoConn::new(cis_handle, ChanKind::Peripheral));
        chan.acl = Some(info.acl);
        chan.state = ChanState::Connecting;
        if let Err(status) = self.controller.le_accept_cis_request(cis_handle) {
            warn!("{:?}: accept of CIS 0x{:x} failed ({:?})", id, cis_handle, status);
            self.chan_disconnected(&mut inner, id, status);
            return Ok(());
        }
        info!(
            "{:?}: accepting CIS 0x{:x} (CIG {}, CIS {})",
            id, cis_handle, info.cig_id, info.cis_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso::qos::Qos;
    use crate::iso::test::{io_qos, Command, Op, TestContext, TestEvent};
    use std::cell::RefCell;

    const PERIPHERAL_ACL: u16 = 0x0010;
    const CIS_HANDLE: u16 = 0x0e40;

    struct TestServer {
        level: SecurityLevel,
        chans: RefCell<Vec<ChanId>>,
        requests: RefCell<Vec<AcceptInfo>>,
    }

    impl TestServer {
        fn new(level: SecurityLevel, chans: Vec<ChanId>) -> Rc<TestServer> {
            let requests = RefCell::new(vec![]);
            Rc::new(TestServer { level, chans: RefCell::new(chans), requests })
        }
    }

    impl IsoServer for TestServer {
        fn security_level(&self) -> SecurityLevel {
            self.level
        }

        fn accept(&self, info: &AcceptInfo) -> Result<ChanId, ErrorCode> {
            self.requests.borrow_mut().push(*info);
            self.chans.borrow_mut().pop().ok_or(ErrorCode::ConnectionRejectedLimitedResources)
        }
    }

    #[test]
    fn accept_and_release() {
        let ctx = TestContext::new();
        ctx.iso.acl_connected(PERIPHERAL_ACL, Role::Peripheral, SecurityLevel::L2);
        let (chan, ops) = ctx.chan();
        let server = TestServer::new(SecurityLevel::L2, vec![chan]);
        ctx.iso.register_server(server.clone()).unwrap();

        ctx.iso.cis_request(PERIPHERAL_ACL, CIS_HANDLE, 1, 3);
        assert_eq!(
            *server.requests.borrow(),
            vec![AcceptInfo { acl: PERIPHERAL_ACL, cig_id: 1, cis_id: 3 }]
        );
        assert_eq!(ctx.controller.take(), vec![Command::AcceptCis(CIS_HANDLE)]);
        assert_eq!(ctx.iso.chan_state(chan), Ok(ChanState::Connecting));

        let handle = ctx.establish(chan);
        assert_eq!(handle, CIS_HANDLE);
        assert_eq!(ops.take(), vec![TestEvent::Connected]);
        let info = ctx.iso.chan_info(chan).unwrap();
        assert_eq!(info.kind, Some(ChanKind::Peripheral));
        assert_eq!(info.acl, Some(PERIPHERAL_ACL));
        assert!(info.can_send && info.can_recv);

        ctx.iso.disconnection_complete(CIS_HANDLE, ErrorCode::RemoteUserTerminatedConnection);
        assert_eq!(
            ops.take(),
            vec![TestEvent::Disconnected(ErrorCode::RemoteUserTerminatedConnection)]
        );
        let info = ctx.iso.chan_info(chan).unwrap();
        assert_eq!((info.handle, info.acl), (None, None));
        assert_eq!(ctx.iso.chan_free(chan), Ok(()));
    }

    #[test]
    fn rejections() {
        let ctx = TestContext::new();
        ctx.iso.acl_connected(PERIPHERAL_ACL, Role::Peripheral, SecurityLevel::L1);
        let (chan, _) = ctx.chan();
        let (bound, _) = ctx.chan();
        ctx.cig(&[bound]);

        ctx.iso.cis_request(PERIPHERAL_ACL, CIS_HANDLE, 0, 0);
        assert_eq!(
            ctx.controller.take(),
            vec![Command::RejectCis(CIS_HANDLE, ErrorCode::UnsupportedFeatureOrParameterValue)]
        );

        let server = TestServer::new(SecurityLevel::L2, vec![]);
        ctx.iso.register_server(server.clone()).unwrap();
        assert!(ctx.iso.register_server(server.clone()).is_err());
        ctx.iso.cis_request(PERIPHERAL_ACL, CIS_HANDLE, 0, 0);
        ctx.iso.cis_request(0x0999, CIS_HANDLE, 0, 0);
        assert_eq!(
            ctx.controller.take(),
            vec![
                Command::RejectCis(CIS_HANDLE, ErrorCode::InsufficientSecurity),
                Command::RejectCis(CIS_HANDLE, ErrorCode::UnknownConnection),
            ]
        );
        assert!(server.requests.borrow().is_empty());

        ctx.iso.unregister_server().unwrap();
        let server = TestServer::new(SecurityLevel::L1, vec![bound]);
        ctx.iso.register_server(server.clone()).unwrap();
        // A channel of a CIG cannot take a request.
        ctx.iso.cis_request(PERIPHERAL_ACL, CIS_HANDLE, 0, 0);
        // No channel left.
        ctx.iso.cis_request(PERIPHERAL_ACL, CIS_HANDLE, 0, 0);
        assert_eq!(
            ctx.controller.take(),
            vec![
                Command::RejectCis(CIS_HANDLE, ErrorCode::ConnectionRejectedLimitedResources),
                Command::RejectCis(CIS_HANDLE, ErrorCode::ConnectionRejectedLimitedResources),
            ]
        );
        assert_eq!(ctx.iso.chan_state(chan), Ok(ChanState::Disconnected));
    }

    #[test]
    fn accept_failure() {
        let ctx = TestContext::new();
        ctx.iso.acl_connected(PERIPHERAL_ACL, Role::Peripheral, SecurityLevel::L1);
        let (chan, ops) = ctx.chan_with_qos(Qos { tx: None, rx: Some(io_qos(60)) });
        ctx.iso.register_server(TestServer::new(SecurityLevel::L1, vec![chan])).unwrap();

        ctx.controller.fail(Op::AcceptCis, ErrorCode::CommandDisallowed);
        ctx.iso.cis_request(PERIPHERAL_ACL, CIS_HANDLE, 0, 0);
        assert_eq!(ops.take(), vec![TestEvent::Disconnected(ErrorCode::CommandDisallowed)]);
        assert_eq!(ctx.iso.chan_info(chan).unwrap().handle, None);
    }
}
