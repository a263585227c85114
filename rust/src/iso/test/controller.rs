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

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

use crate::hci::{
    microseconds, slots, BigParameters, BigSyncParameters, CigParameters, CisEstablished,
    CisParametersConfig, Controller, CreateCisConfig, DataPath, DataPathDirection, ErrorCode,
    SecurityLevel, PHY_LE_2M,
};

/// Command issued by the core, in issue order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    SetCigParameters(CigParameters),
    RemoveCig(u8),
    CreateCis(Vec<CreateCisConfig>),
    AcceptCis(u16),
    RejectCis(u16, ErrorCode),
    Disconnect(u16, ErrorCode),
    CreateBig(BigParameters),
    TerminateBig(u8, ErrorCode),
    BigCreateSync(BigSyncParameters),
    BigTerminateSync(u8),
    SetupDataPath(u16, DataPathDirection, DataPath),
    RemoveDataPath(u16, DataPathDirection),
    SetSecurity(u16, SecurityLevel),
    SendIsoData(Bytes),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    SetCigParameters,
    RemoveCig,
    CreateCis,
    AcceptCis,
    RejectCis,
    Disconnect,
    CreateBig,
    TerminateBig,
    BigCreateSync,
    BigTerminateSync,
    SetupDataPath,
    RemoveDataPath,
    SetSecurity,
    SendIsoData,
}

impl Command {
    fn op(&self) -> Op {
        match self {
            Command::SetCigParameters(_) => Op::SetCigParameters,
            Command::RemoveCig(_) => Op::RemoveCig,
            Command::CreateCis(_) => Op::CreateCis,
            Command::AcceptCis(_) => Op::AcceptCis,
            Command::RejectCis(..) => Op::RejectCis,
            Command::Disconnect(..) => Op::Disconnect,
            Command::CreateBig(_) => Op::CreateBig,
            Command::TerminateBig(..) => Op::TerminateBig,
            Command::BigCreateSync(_) => Op::BigCreateSync,
            Command::BigTerminateSync(_) => Op::BigTerminateSync,
            Command::SetupDataPath(..) => Op::SetupDataPath,
            Command::RemoveDataPath(..) => Op::RemoveDataPath,
            Command::SetSecurity(..) => Op::SetSecurity,
            Command::SendIsoData(_) => Op::SendIsoData,
        }
    }
}

/// Configured CIS, as requested with LE Set CIG Parameters.
#[derive(Clone)]
struct Cis {
    cig_id: u8,
    cis_id: u8,
    sdu_interval_c_to_p: microseconds,
    sdu_interval_p_to_c: microseconds,
    framed: bool,
    config: CisParametersConfig,
}

/// Controller recording every command. Commands succeed unless a
/// failure was queued for them with [`TestController::fail`].
#[derive(Default)]
pub struct TestController {
    commands: RefCell<VecDeque<Command>>,
    failures: RefCell<Vec<(Op, ErrorCode)>>,
    withheld: Cell<usize>,
    cis: RefCell<HashMap<u16, Cis>>,
}

impl TestController {
    /// Fail the next command of kind `op` with `status`.
    pub fn fail(&self, op: Op, status: ErrorCode) {
        self.failures.borrow_mut().push((op, status));
    }

    /// Return `count` fewer connection handles than requested on the next
    /// LE Set CIG Parameters.
    pub fn withhold_handles(&self, count: usize) {
        self.withheld.set(count);
    }

    pub fn take(&self) -> Vec<Command> {
        self.commands.borrow_mut().drain(..).collect()
    }

    pub fn clear(&self) {
        self.commands.borrow_mut().clear();
    }

    /// Remove the ISO data packets from the recorded commands.
    pub fn sent_packets(&self) -> Vec<Bytes> {
        let mut commands = self.commands.borrow_mut();
        let mut packets = vec![];
        commands.retain(|command| match command {
            Command::SendIsoData(packet) => {
                packets.push(packet.clone());
                false
            }
            _ => true,
        });
        packets
    }

    /// Parameters of LE CIS Established for the CIS `handle`, negotiated
    /// from its configuration. Accepted CIS the controller has no
    /// configuration for get one PDU per interval in each direction.
    pub fn established(&self, handle: u16) -> CisEstablished {
        let Some(cis) = self.cis.borrow().get(&handle).cloned() else {
            return CisEstablished {
                cig_sync_delay: 10_000,
                cis_sync_delay: 10_000,
                transport_latency_c_to_p: 10_000,
                transport_latency_p_to_c: 10_000,
                phy_c_to_p: PHY_LE_2M,
                phy_p_to_c: PHY_LE_2M,
                nse: 1,
                bn_c_to_p: 1,
                bn_p_to_c: 1,
                ft_c_to_p: 1,
                ft_p_to_c: 1,
                max_pdu_c_to_p: 251,
                max_pdu_p_to_c: 251,
                iso_interval: 8,
            };
        };

        let config = &cis.config;
        let bn_c_to_p = config.max_sdu_c_to_p.div_ceil(251) as u8;
        let bn_p_to_c = config.max_sdu_p_to_c.div_ceil(251) as u8;
        let nse = bn_c_to_p.max(bn_p_to_c);
        let iso_interval =
            iso_interval(cis.sdu_interval_c_to_p, cis.sdu_interval_p_to_c, cis.framed);
        let cig_sync_delay = iso_interval as u32 * 1250;

        CisEstablished {
            cig_sync_delay,
            cis_sync_delay: cig_sync_delay,
            transport_latency_c_to_p: transport_latency(
                cig_sync_delay,
                iso_interval,
                cis.sdu_interval_c_to_p,
                cis.framed,
            ),
            transport_latency_p_to_c: transport_latency(
                cig_sync_delay,
                iso_interval,
                cis.sdu_interval_p_to_c,
                cis.framed,
            ),
            phy_c_to_p: config.phy_c_to_p,
            phy_p_to_c: config.phy_p_to_c,
            nse,
            bn_c_to_p,
            bn_p_to_c,
            ft_c_to_p: 1,
            ft_p_to_c: 1,
            max_pdu_c_to_p: 251,
            max_pdu_p_to_c: 251,
            iso_interval,
        }
    }

    fn record(&self, command: Command) -> Result<(), ErrorCode> {
        let op = command.op();
        self.commands.borrow_mut().push_back(command);
        let mut failures = self.failures.borrow_mut();
        match failures.iter().position(|(failing, _)| *failing == op) {
            Some(index) => Err(failures.remove(index).1),
            None => Ok(()),
        }
    }

    // Returns the handle of the CIS (cig_id, cis_id), allocating the first
    // unused handle in the range 0xe00..0xefe.
    fn cis_handle(&self, cig_id: u8, cis_id: u8) -> Option<u16> {
        let cis = self.cis.borrow();
        let existing = cis
            .iter()
            .find(|(_, cis)| cis.cig_id == cig_id && cis.cis_id == cis_id)
            .map(|(handle, _)| *handle);
        existing.or_else(|| (0xe00..0xefe).find(|handle| !cis.contains_key(handle)))
    }
}

fn iso_interval(
    sdu_interval_c_to_p: microseconds,
    sdu_interval_p_to_c: microseconds,
    framed: bool,
) -> slots {
    let iso_interval = if framed {
        std::cmp::max(sdu_interval_c_to_p, sdu_interval_p_to_c)
    } else {
        let sdu_interval = match (sdu_interval_c_to_p, sdu_interval_p_to_c) {
            (0, _) => sdu_interval_p_to_c,
            (_, 0) => sdu_interval_c_to_p,
            _ => num_integer::lcm(sdu_interval_c_to_p, sdu_interval_p_to_c),
        };
        num_integer::lcm(1250, sdu_interval)
    };
    ((iso_interval + 1249) / 1250) as slots
}

fn transport_latency(
    cig_sync_delay: microseconds,
    iso_interval: slots,
    sdu_interval: microseconds,
    framed: bool,
) -> microseconds {
    let iso_interval = iso_interval as u32 * 1250;
    if framed {
        cig_sync_delay + iso_interval + sdu_interval
    } else {
        cig_sync_delay + iso_interval - sdu_interval
    }
}

impl Controller for TestController {
    fn le_set_cig_parameters(&self, parameters: &CigParameters) -> Result<Vec<u16>, ErrorCode> {
        self.record(Command::SetCigParameters(parameters.clone()))?;

        let mut handles = vec![];
        for config in &parameters.cis_config {
            let handle = self
                .cis_handle(parameters.cig_id, config.cis_id)
                .ok_or(ErrorCode::MemoryCapacityExceeded)?;
            self.cis.borrow_mut().insert(
                handle,
                Cis {
                    cig_id: parameters.cig_id,
                    cis_id: config.cis_id,
                    sdu_interval_c_to_p: parameters.sdu_interval_c_to_p,
                    sdu_interval_p_to_c: parameters.sdu_interval_p_to_c,
                    framed: parameters.framing != 0,
                    config: config.clone(),
                },
            );
            handles.push(handle);
        }
        let withheld = self.withheld.replace(0);
        handles.truncate(handles.len().saturating_sub(withheld));
        Ok(handles)
    }

    fn le_remove_cig(&self, cig_id: u8) -> Result<(), ErrorCode> {
        self.record(Command::RemoveCig(cig_id))?;
        self.cis.borrow_mut().retain(|_, cis| cis.cig_id != cig_id);
        Ok(())
    }

    fn le_create_cis(&self, cis_config: &[CreateCisConfig]) -> Result<(), ErrorCode> {
        self.record(Command::CreateCis(cis_config.to_vec()))
    }

    fn le_accept_cis_request(&self, connection_handle: u16) -> Result<(), ErrorCode> {
        self.record(Command::AcceptCis(connection_handle))
    }

    fn le_reject_cis_request(
        &self,
        connection_handle: u16,
        reason: ErrorCode,
    ) -> Result<(), ErrorCode> {
        self.record(Command::RejectCis(connection_handle, reason))
    }

    fn disconnect(&self, connection_handle: u16, reason: ErrorCode) -> Result<(), ErrorCode> {
        self.record(Command::Disconnect(connection_handle, reason))
    }

    fn le_create_big(&self, parameters: &BigParameters) -> Result<(), ErrorCode> {
        self.record(Command::CreateBig(parameters.clone()))
    }

    fn le_terminate_big(&self, big_handle: u8, reason: ErrorCode) -> Result<(), ErrorCode> {
        self.record(Command::TerminateBig(big_handle, reason))
    }

    fn le_big_create_sync(&self, parameters: &BigSyncParameters) -> Result<(), ErrorCode> {
        self.record(Command::BigCreateSync(parameters.clone()))
    }

    fn le_big_terminate_sync(&self, big_handle: u8) -> Result<(), ErrorCode> {
        self.record(Command::BigTerminateSync(big_handle))
    }

    fn le_setup_iso_data_path(
        &self,
        connection_handle: u16,
        direction: DataPathDirection,
        path: &DataPath,
    ) -> Result<(), ErrorCode> {
        self.record(Command::SetupDataPath(connection_handle, direction, path.clone()))
    }

    fn le_remove_iso_data_path(
        &self,
        connection_handle: u16,
        direction: DataPathDirection,
    ) -> Result<(), ErrorCode> {
        self.record(Command::RemoveDataPath(connection_handle, direction))
    }

    fn set_security(
        &self,
        acl_connection_handle: u16,
        level: SecurityLevel,
    ) -> Result<(), ErrorCode> {
        self.record(Command::SetSecurity(acl_connection_handle, level))
    }

    fn send_iso_data(&self, packet: Bytes) -> Result<(), ErrorCode> {
        self.record(Command::SendIsoData(packet))
    }
}
