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

//! Host / Controller boundary consumed by the isochronous core.
//!
//! Commands are issued through the [`Controller`] trait and report the
//! Command Status / Command Complete outcome synchronously. Asynchronous
//! events are fed back into [`crate::iso::Iso`] by the owner of the
//! transport.

use bytes::Bytes;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

#[allow(non_camel_case_types)]
pub type microseconds = u32;

#[allow(non_camel_case_types)]
pub type slots = u16;

/// HCI status and reason codes, Vol 1, Part F.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0x00,
    UnknownHciCommand = 0x01,
    UnknownConnection = 0x02,
    HardwareFailure = 0x03,
    PageTimeout = 0x04,
    AuthenticationFailure = 0x05,
    PinOrKeyMissing = 0x06,
    MemoryCapacityExceeded = 0x07,
    ConnectionTimeout = 0x08,
    ConnectionLimitExceeded = 0x09,
    ConnectionAlreadyExists = 0x0b,
    CommandDisallowed = 0x0c,
    ConnectionRejectedLimitedResources = 0x0d,
    ConnectionRejectedSecurityReasons = 0x0e,
    UnsupportedFeatureOrParameterValue = 0x11,
    InvalidHciCommandParameters = 0x12,
    RemoteUserTerminatedConnection = 0x13,
    ConnectionTerminatedByLocalHost = 0x16,
    UnspecifiedError = 0x1f,
    InsufficientSecurity = 0x2f,
    ControllerBusy = 0x3a,
    ConnectionFailedToBeEstablished = 0x3e,
    OperationCancelledByHost = 0x44,
}

impl ErrorCode {
    pub fn is_success(&self) -> bool {
        *self == ErrorCode::Success
    }
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        ErrorCode::from_u8(value).unwrap_or(ErrorCode::UnspecifiedError)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Central,
    Peripheral,
}

/// Link security levels, ordered from weakest to strongest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityLevel {
    /// No encryption and no authentication.
    #[default]
    L1,
    /// Encryption without authentication.
    L2,
    /// Encryption with authentication.
    L3,
    /// Authenticated LE Secure Connections.
    L4,
}

/// LE PHY bits, shared by the CIG and BIG parameter commands.
pub const PHY_LE_1M: u8 = 0x1;
pub const PHY_LE_2M: u8 = 0x2;
pub const PHY_LE_CODED: u8 = 0x4;

/// Coding format identifying transparent (codec-less) data.
pub const CODING_FORMAT_TRANSPARENT: u8 = 0x3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataPathDirection {
    /// Host to Controller.
    Input,
    /// Controller to Host.
    Output,
}

/// Codec_ID field of HCI LE Setup ISO Data Path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecId {
    pub coding_format: u8,
    pub company_id: u16,
    pub vendor_codec_id: u16,
}

impl Default for CodecId {
    fn default() -> Self {
        CodecId { coding_format: CODING_FORMAT_TRANSPARENT, company_id: 0, vendor_codec_id: 0 }
    }
}

/// HCI LE Setup ISO Data Path parameters, minus the connection handle
/// and direction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataPath {
    pub path_id: u8,
    pub codec_id: CodecId,
    pub controller_delay: microseconds,
    pub codec_configuration: Vec<u8>,
}

/// Per CIS entry of HCI LE Set CIG Parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CisParametersConfig {
    pub cis_id: u8,
    pub max_sdu_c_to_p: u16,
    pub max_sdu_p_to_c: u16,
    pub phy_c_to_p: u8,
    pub phy_p_to_c: u8,
    pub rtn_c_to_p: u8,
    pub rtn_p_to_c: u8,
}

/// HCI LE Set CIG Parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CigParameters {
    pub cig_id: u8,
    pub sdu_interval_c_to_p: microseconds,
    pub sdu_interval_p_to_c: microseconds,
    pub worst_case_sca: u8,
    pub packing: u8,
    pub framing: u8,
    pub max_transport_latency_c_to_p: u16,
    pub max_transport_latency_p_to_c: u16,
    pub cis_config: Vec<CisParametersConfig>,
}

/// One entry of HCI LE Create CIS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreateCisConfig {
    pub cis_connection_handle: u16,
    pub acl_connection_handle: u16,
}

/// HCI LE Create BIG.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BigParameters {
    pub big_handle: u8,
    pub advertising_handle: u8,
    pub num_bis: u8,
    pub sdu_interval: microseconds,
    pub max_sdu: u16,
    pub max_transport_latency: u16,
    pub rtn: u8,
    pub phy: u8,
    pub packing: u8,
    pub framing: u8,
    pub broadcast_code: Option<[u8; 16]>,
}

/// HCI LE BIG Create Sync.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BigSyncParameters {
    pub big_handle: u8,
    pub sync_handle: u16,
    pub broadcast_code: Option<[u8; 16]>,
    pub mse: u8,
    pub big_sync_timeout: u16,
    pub bis: Vec<u8>,
}

/// Negotiated parameters reported by HCI LE CIS Established.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CisEstablished {
    pub cig_sync_delay: microseconds,
    pub cis_sync_delay: microseconds,
    pub transport_latency_c_to_p: microseconds,
    pub transport_latency_p_to_c: microseconds,
    pub phy_c_to_p: u8,
    pub phy_p_to_c: u8,
    pub nse: u8,
    pub bn_c_to_p: u8,
    pub bn_p_to_c: u8,
    pub ft_c_to_p: u8,
    pub ft_p_to_c: u8,
    pub max_pdu_c_to_p: u16,
    pub max_pdu_p_to_c: u16,
    pub iso_interval: slots,
}

/// Negotiated parameters reported by HCI LE Create BIG Complete
/// and HCI LE BIG Sync Established.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BigEstablished {
    pub transport_latency: microseconds,
    pub phy: u8,
    pub nse: u8,
    pub bn: u8,
    pub pto: u8,
    pub irc: u8,
    pub max_pdu: u16,
    pub iso_interval: slots,
}

/// Commands issued by the isochronous core.
///
/// Implementations must not call back into the core from these methods:
/// every outcome beyond the synchronous command status is reported later
/// through the event entry points of [`crate::iso::Iso`].
pub trait Controller {
    /// Returns the CIS connection handles assigned by the controller,
    /// in the order of `cis_config`.
    fn le_set_cig_parameters(&self, parameters: &CigParameters) -> Result<Vec<u16>, ErrorCode>;
    fn le_remove_cig(&self, cig_id: u8) -> Result<(), ErrorCode>;
    fn le_create_cis(&self, cis_config: &[CreateCisConfig]) -> Result<(), ErrorCode>;
    fn le_accept_cis_request(&self, connection_handle: u16) -> Result<(), ErrorCode>;
    fn le_reject_cis_request(&self, connection_handle: u16, reason: ErrorCode)
        -> Result<(), ErrorCode>;
    fn disconnect(&self, connection_handle: u16, reason: ErrorCode) -> Result<(), ErrorCode>;

    fn le_create_big(&self, parameters: &BigParameters) -> Result<(), ErrorCode>;
    fn le_terminate_big(&self, big_handle: u8, reason: ErrorCode) -> Result<(), ErrorCode>;
    fn le_big_create_sync(&self, parameters: &BigSyncParameters) -> Result<(), ErrorCode>;
    fn le_big_terminate_sync(&self, big_handle: u8) -> Result<(), ErrorCode>;

    fn le_setup_iso_data_path(
        &self,
        connection_handle: u16,
        direction: DataPathDirection,
        path: &DataPath,
    ) -> Result<(), ErrorCode>;
    fn le_remove_iso_data_path(
        &self,
        connection_handle: u16,
        direction: DataPathDirection,
    ) -> Result<(), ErrorCode>;

    /// Start the security procedure on an ACL connection. Completion is
    /// reported with [`crate::iso::Iso::security_changed`].
    fn set_security(&self, acl_connection_handle: u16, level: SecurityLevel)
        -> Result<(), ErrorCode>;

    /// Queue one encoded HCI ISO data packet for transmission.
    fn send_iso_data(&self, packet: Bytes) -> Result<(), ErrorCode>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_from_raw() {
        assert_eq!(ErrorCode::from(0x3e), ErrorCode::ConnectionFailedToBeEstablished);
        assert_eq!(ErrorCode::from(0x00), ErrorCode::Success);
        assert_eq!(ErrorCode::from(0xfe), ErrorCode::UnspecifiedError);
    }

    #[test]
    fn security_levels_are_ordered() {
        assert!(SecurityLevel::L1 < SecurityLevel::L2);
        assert!(SecurityLevel::L4 > SecurityLevel::L3);
        assert_eq!(SecurityLevel::default(), SecurityLevel::L1);
    }
}
