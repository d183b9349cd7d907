//! DP service telegrams.
//!
//! Each DP service is encoded on top of an FDL telegram.  The SAP numbers
//! travel as single-octet address extensions, the service payload is the
//! remaining data unit.  A service with no payload and no SAPs becomes an
//! SD1 telegram, 8 effective payload octets become SD3, everything else
//! SD2.

use crate::consts;
use crate::dp::DpError;
use crate::fdl;

bitflags::bitflags! {
    /// First status octet of a `Slave_Diag` confirmation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct DiagStatus1: u8 {
        const STATION_NON_EXISTENT = 0x01;
        const STATION_NOT_READY =    0x02;
        const CFG_FAULT =            0x04;
        const EXT_DIAG =             0x08;
        const NOT_SUPPORTED =        0x10;
        const INVALID_RESPONSE =     0x20;
        const PRM_FAULT =            0x40;
        const MASTER_LOCK =          0x80;
    }
}

bitflags::bitflags! {
    /// Second status octet of a `Slave_Diag` confirmation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct DiagStatus2: u8 {
        const PRM_REQ =     0x01;
        const STAT_DIAG =   0x02;
        const ALWAYS_ONE =  0x04;
        const WATCHDOG_ON = 0x08;
        const FREEZE_MODE = 0x10;
        const SYNC_MODE =   0x20;
        const RESERVED =    0x40;
        const DEACTIVATED = 0x80;
    }
}

bitflags::bitflags! {
    /// Third status octet of a `Slave_Diag` confirmation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct DiagStatus3: u8 {
        const EXT_DIAG_OVERFLOW = 0x80;
    }
}

bitflags::bitflags! {
    /// `Station_Status` octet of a `Set_Prm` request.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StationStatus: u8 {
        const WATCHDOG_ON = 0x08;
        const FREEZE_REQ =  0x10;
        const SYNC_REQ =    0x20;
        const UNLOCK_REQ =  0x40;
        const LOCK_REQ =    0x80;
    }
}

bitflags::bitflags! {
    /// `Control_Command` octet of a `Global_Control` telegram.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ControlCommand: u8 {
        /// Clear_Data: clear all outputs
        const CLEAR_DATA = 0x02;
        /// Unfreeze: input freezing is cancelled
        const UNFREEZE =   0x04;
        /// Freeze: inputs are frozen
        const FREEZE =     0x08;
        /// Unsync: output syncing is cancelled
        const UNSYNC =     0x10;
        /// Sync: outputs are synced
        const SYNC =       0x20;
    }
}

/// Bits of the first DPV1 `User_Prm_Data` octet.
pub mod dpv1_prm {
    /// 1 ms watchdog base
    pub const WD_BASE_1MS: u8 = 0x04;
    /// Run as publisher
    pub const PUBLISHER: u8 = 0x20;
    /// Fail_Safe mode
    pub const FAIL_SAFE: u8 = 0x40;
    /// DPV1 mode enable
    pub const V1_MODE: u8 = 0x80;
}

/// Extract the SAP number from an address extension chain.
///
/// The SAP is carried by the first octet which is not a segment address.
fn extract_sap(ae: &[u8]) -> Option<u8> {
    ae.iter()
        .find(|&&b| b & consts::AE_SEGMENT == 0)
        .map(|&b| b & consts::AE_ADDRESS)
}

/// Wrap a DP service payload into the appropriate FDL telegram class.
fn build_fdl(
    da: u8,
    sa: u8,
    fc: fdl::FunctionCode,
    dsap: Option<u8>,
    ssap: Option<u8>,
    du: Vec<u8>,
) -> fdl::Telegram {
    let dae: Vec<u8> = dsap.into_iter().collect();
    let sae: Vec<u8> = ssap.into_iter().collect();

    match du.len() + dae.len() + sae.len() {
        0 => fdl::TelegramSd1 { da, sa, fc }.into(),
        8 => fdl::TelegramSd3 {
            da,
            sa,
            fc,
            dae,
            sae,
            du,
        }
        .into(),
        _ => fdl::TelegramSd2 {
            da,
            sa,
            fc,
            dae,
            sae,
            du,
        }
        .into(),
    }
}

fn new_request_fc(req: fdl::RequestType) -> fdl::FunctionCode {
    fdl::FunctionCode::Request {
        fcb: fdl::FrameCountBit::Inactive,
        req,
    }
}

fn new_slave_response_fc() -> fdl::FunctionCode {
    fdl::FunctionCode::Response {
        state: fdl::ResponseState::Slave,
        status: fdl::ResponseStatus::DataLow,
    }
}

/// `Slave_Diag` request (master to slave).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SlaveDiagRequest {
    pub da: u8,
    pub sa: u8,
    pub fc: fdl::FunctionCode,
}

impl SlaveDiagRequest {
    pub fn new(da: u8, sa: u8) -> Self {
        Self {
            da,
            sa,
            fc: new_request_fc(fdl::RequestType::SrdHigh),
        }
    }

    pub fn to_fdl(&self) -> fdl::Telegram {
        build_fdl(
            self.da,
            self.sa,
            self.fc,
            Some(consts::DSAP_SLAVE_DIAG),
            Some(consts::SSAP_MS0),
            Vec::new(),
        )
    }
}

/// `Slave_Diag` confirmation (slave to master).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SlaveDiagConfirm {
    pub da: u8,
    pub sa: u8,
    pub fc: fdl::FunctionCode,
    pub status_1: DiagStatus1,
    pub status_2: DiagStatus2,
    pub status_3: DiagStatus3,
    /// Address of the master this slave is locked to (255 = none).
    pub master_address: u8,
    pub ident_number: u16,
    /// Extended diagnosis blocks, kept as raw octets.
    pub ext_diag: Vec<u8>,
}

impl SlaveDiagConfirm {
    pub fn new(da: u8, sa: u8) -> Self {
        Self {
            da,
            sa,
            fc: new_slave_response_fc(),
            status_1: DiagStatus1::empty(),
            status_2: DiagStatus2::empty(),
            status_3: DiagStatus3::empty(),
            master_address: 255,
            ident_number: 0,
            ext_diag: Vec::new(),
        }
    }

    fn from_parts(da: u8, sa: u8, fc: fdl::FunctionCode, du: &[u8]) -> Result<Self, DpError> {
        if du.len() < 6 {
            return Err(DpError::InvalidTelegram("Slave_Diag"));
        }
        Ok(Self {
            da,
            sa,
            fc,
            status_1: DiagStatus1::from_bits_retain(du[0]),
            status_2: DiagStatus2::from_bits_retain(du[1]),
            status_3: DiagStatus3::from_bits_retain(du[2]),
            master_address: du[3],
            ident_number: u16::from_be_bytes([du[4], du[5]]),
            ext_diag: du[6..].to_vec(),
        })
    }

    fn du(&self) -> Vec<u8> {
        let mut du = vec![
            self.status_1.bits(),
            self.status_2.bits(),
            self.status_3.bits(),
            self.master_address,
        ];
        du.extend_from_slice(&self.ident_number.to_be_bytes());
        du.extend_from_slice(&self.ext_diag);
        du
    }

    pub fn to_fdl(&self) -> fdl::Telegram {
        build_fdl(
            self.da,
            self.sa,
            self.fc,
            Some(consts::SSAP_MS0),
            Some(consts::DSAP_SLAVE_DIAG),
            self.du(),
        )
    }

    pub fn not_exist(&self) -> bool {
        self.status_1.contains(DiagStatus1::STATION_NON_EXISTENT)
    }

    pub fn not_ready(&self) -> bool {
        self.status_1.contains(DiagStatus1::STATION_NOT_READY)
    }

    pub fn cfg_fault(&self) -> bool {
        self.status_1.contains(DiagStatus1::CFG_FAULT)
    }

    pub fn has_ext_diag(&self) -> bool {
        self.status_1.contains(DiagStatus1::EXT_DIAG)
    }

    pub fn not_supported(&self) -> bool {
        self.status_1.contains(DiagStatus1::NOT_SUPPORTED)
    }

    pub fn prm_fault(&self) -> bool {
        self.status_1.contains(DiagStatus1::PRM_FAULT)
    }

    pub fn master_lock(&self) -> bool {
        self.status_1.contains(DiagStatus1::MASTER_LOCK)
    }

    pub fn prm_req(&self) -> bool {
        self.status_2.contains(DiagStatus2::PRM_REQ)
    }

    pub fn stat_diag(&self) -> bool {
        self.status_2.contains(DiagStatus2::STAT_DIAG)
    }

    pub fn has_always_one_bit(&self) -> bool {
        self.status_2.contains(DiagStatus2::ALWAYS_ONE)
    }

    pub fn ext_diag_overflow(&self) -> bool {
        self.status_3.contains(DiagStatus3::EXT_DIAG_OVERFLOW)
    }

    /// The slave needs a new parameterization/configuration cycle.
    pub fn needs_new_prm_cfg(&self) -> bool {
        self.cfg_fault() || self.prm_fault() || self.prm_req()
    }

    /// The slave is ready for cyclic `Data_Exchange`.
    pub fn is_ready_data_ex(&self) -> bool {
        !self.status_1.intersects(
            DiagStatus1::STATION_NON_EXISTENT
                | DiagStatus1::STATION_NOT_READY
                | DiagStatus1::CFG_FAULT
                | DiagStatus1::PRM_FAULT,
        ) && !self.prm_req()
    }
}

/// `Set_Prm` request (master to slave).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SetPrmRequest {
    pub da: u8,
    pub sa: u8,
    pub fc: fdl::FunctionCode,
    pub station_status: StationStatus,
    pub wd_fact_1: u8,
    pub wd_fact_2: u8,
    /// min T<sub>SDR</sub> in bit times (0 = no change).
    pub min_tsdr: u8,
    pub ident_number: u16,
    /// Group membership mask (`LOCK_REQ` must be set for it to apply).
    pub group_ident: u8,
    pub user_prm_data: Vec<u8>,
}

impl SetPrmRequest {
    pub fn new(da: u8, sa: u8) -> Self {
        Self {
            da,
            sa,
            fc: new_request_fc(fdl::RequestType::SrdHigh),
            station_status: StationStatus::LOCK_REQ,
            wd_fact_1: 1,
            wd_fact_2: 1,
            min_tsdr: 0,
            ident_number: 0,
            group_ident: 0,
            user_prm_data: Vec::new(),
        }
    }

    fn from_parts(da: u8, sa: u8, fc: fdl::FunctionCode, du: &[u8]) -> Result<Self, DpError> {
        if du.len() < 7 {
            return Err(DpError::InvalidTelegram("Set_Prm"));
        }
        Ok(Self {
            da,
            sa,
            fc,
            station_status: StationStatus::from_bits_retain(du[0]),
            wd_fact_1: du[1],
            wd_fact_2: du[2],
            min_tsdr: du[3],
            ident_number: u16::from_be_bytes([du[4], du[5]]),
            group_ident: du[6],
            user_prm_data: du[7..].to_vec(),
        })
    }

    fn du(&self) -> Vec<u8> {
        let mut du = vec![
            self.station_status.bits(),
            self.wd_fact_1,
            self.wd_fact_2,
            self.min_tsdr,
        ];
        du.extend_from_slice(&self.ident_number.to_be_bytes());
        du.push(self.group_ident);
        du.extend_from_slice(&self.user_prm_data);
        du
    }

    pub fn to_fdl(&self) -> fdl::Telegram {
        build_fdl(
            self.da,
            self.sa,
            self.fc,
            Some(consts::DSAP_SET_PRM),
            Some(consts::SSAP_MS0),
            self.du(),
        )
    }

    pub fn set_sync_mode(&mut self, enabled: bool) {
        self.station_status.set(StationStatus::SYNC_REQ, enabled);
    }

    pub fn set_freeze_mode(&mut self, enabled: bool) {
        self.station_status.set(StationStatus::FREEZE_REQ, enabled);
    }

    /// Set the slave watchdog timeout.  `0` disables the watchdog.
    ///
    /// The timeout is encoded as two factors with a 10 ms base: the
    /// smallest power-of-two `fact_2` is chosen such that
    /// `ceil(ms / 10 / fact_2)` still fits into one octet.
    pub fn set_watchdog(&mut self, timeout_ms: u32) -> Result<(), DpError> {
        if timeout_ms == 0 {
            self.station_status.remove(StationStatus::WATCHDOG_ON);
            return Ok(());
        }
        self.station_status.insert(StationStatus::WATCHDOG_ON);

        let mut fact_2: u32 = 1;
        while timeout_ms.div_ceil(10 * fact_2) > 255 {
            fact_2 *= 2;
            if fact_2 > 255 {
                return Err(DpError::WatchdogOutOfRange(timeout_ms));
            }
        }
        self.wd_fact_1 = timeout_ms.div_ceil(10 * fact_2).max(1) as u8;
        self.wd_fact_2 = fact_2 as u8;
        Ok(())
    }

    /// Apply a DPV1 override to the first three `User_Prm_Data` octets.
    pub fn apply_dpv1_override(&mut self, mask: &[u8; 3], set: &[u8; 3]) -> Result<(), DpError> {
        if self.user_prm_data.len() < 3 {
            return Err(DpError::Dpv1PrmTooShort);
        }
        for i in 0..3 {
            self.user_prm_data[i] = (self.user_prm_data[i] & !mask[i]) | (set[i] & mask[i]);
        }
        Ok(())
    }
}

/// One configuration data element of a `Chk_Cfg` request.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct CfgDataElement {
    pub identifier: u8,
    pub length_bytes: Vec<u8>,
}

impl CfgDataElement {
    /// Mask for the data length in the identifier octet.
    pub const ID_LEN_MASK: u8 = 0x0F;
    /// Mask for the identifier type.
    pub const ID_TYPE_MASK: u8 = 0x30;
    /// Identifier type: special format, length octets follow.
    pub const ID_TYPE_SPEC: u8 = 0x00;
    /// Identifier type: input.
    pub const ID_TYPE_IN: u8 = 0x10;
    /// Identifier type: output.
    pub const ID_TYPE_OUT: u8 = 0x20;
    /// Identifier type: input/output.
    pub const ID_TYPE_INOUT: u8 = 0x30;
    /// Word (instead of byte) structure.
    pub const ID_LEN_WORDS: u8 = 0x40;
    /// Consistency over the whole length.
    pub const ID_CON_WHOLE: u8 = 0x80;

    pub fn new(identifier: u8, length_bytes: Vec<u8>) -> Self {
        Self {
            identifier,
            length_bytes,
        }
    }

    fn encoded_into(&self, du: &mut Vec<u8>) {
        du.push(self.identifier);
        du.extend_from_slice(&self.length_bytes);
    }
}

impl From<&gsd_parser::CfgDataElement> for CfgDataElement {
    fn from(value: &gsd_parser::CfgDataElement) -> Self {
        Self {
            identifier: value.identifier,
            length_bytes: value.length_bytes.clone(),
        }
    }
}

/// `Chk_Cfg` request (master to slave).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ChkCfgRequest {
    pub da: u8,
    pub sa: u8,
    pub fc: fdl::FunctionCode,
    pub cfg_data: Vec<CfgDataElement>,
}

impl ChkCfgRequest {
    pub fn new(da: u8, sa: u8) -> Self {
        Self {
            da,
            sa,
            fc: new_request_fc(fdl::RequestType::SrdHigh),
            cfg_data: Vec::new(),
        }
    }

    fn from_parts(da: u8, sa: u8, fc: fdl::FunctionCode, du: &[u8]) -> Result<Self, DpError> {
        let mut cfg_data = Vec::new();
        let mut rest = du;
        while let Some((&identifier, tail)) = rest.split_first() {
            if identifier & CfgDataElement::ID_TYPE_MASK == CfgDataElement::ID_TYPE_SPEC {
                let count = usize::from(identifier & CfgDataElement::ID_LEN_MASK);
                if tail.len() < count {
                    return Err(DpError::InvalidTelegram("Chk_Cfg"));
                }
                cfg_data.push(CfgDataElement::new(identifier, tail[..count].to_vec()));
                rest = &tail[count..];
            } else {
                cfg_data.push(CfgDataElement::new(identifier, Vec::new()));
                rest = tail;
            }
        }
        Ok(Self {
            da,
            sa,
            fc,
            cfg_data,
        })
    }

    fn du(&self) -> Vec<u8> {
        let mut du = Vec::new();
        for element in &self.cfg_data {
            element.encoded_into(&mut du);
        }
        du
    }

    pub fn to_fdl(&self) -> fdl::Telegram {
        build_fdl(
            self.da,
            self.sa,
            self.fc,
            Some(consts::DSAP_CHK_CFG),
            Some(consts::SSAP_MS0),
            self.du(),
        )
    }
}

/// `Get_Cfg` request (class 2 master to slave).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GetCfgRequest {
    pub da: u8,
    pub sa: u8,
    pub fc: fdl::FunctionCode,
}

impl GetCfgRequest {
    pub fn new(da: u8, sa: u8) -> Self {
        Self {
            da,
            sa,
            fc: new_request_fc(fdl::RequestType::SrdHigh),
        }
    }

    pub fn to_fdl(&self) -> fdl::Telegram {
        build_fdl(
            self.da,
            self.sa,
            self.fc,
            Some(consts::DSAP_GET_CFG),
            Some(consts::SSAP_MS0),
            Vec::new(),
        )
    }
}

/// `Get_Cfg` confirmation (slave to class 2 master).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GetCfgConfirm {
    pub da: u8,
    pub sa: u8,
    pub fc: fdl::FunctionCode,
    /// The real configuration, as raw config data element octets.
    pub config: Vec<u8>,
}

impl GetCfgConfirm {
    pub fn new(da: u8, sa: u8, config: Vec<u8>) -> Self {
        Self {
            da,
            sa,
            fc: new_slave_response_fc(),
            config,
        }
    }

    pub fn to_fdl(&self) -> fdl::Telegram {
        build_fdl(
            self.da,
            self.sa,
            self.fc,
            Some(consts::SSAP_MS0),
            Some(consts::DSAP_GET_CFG),
            self.config.clone(),
        )
    }
}

/// `Data_Exchange` request (master to slave, no SAPs).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DataExchangeRequest {
    pub da: u8,
    pub sa: u8,
    pub fc: fdl::FunctionCode,
    pub du: Vec<u8>,
}

impl DataExchangeRequest {
    pub fn new(da: u8, sa: u8, du: Vec<u8>) -> Self {
        Self {
            da,
            sa,
            fc: new_request_fc(fdl::RequestType::SrdHigh),
            du,
        }
    }

    pub fn to_fdl(&self) -> fdl::Telegram {
        build_fdl(self.da, self.sa, self.fc, None, None, self.du.clone())
    }
}

/// `Data_Exchange` confirmation (slave to master, no SAPs).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DataExchangeConfirm {
    pub da: u8,
    pub sa: u8,
    pub fc: fdl::FunctionCode,
    pub du: Vec<u8>,
}

impl DataExchangeConfirm {
    pub fn new(da: u8, sa: u8, du: Vec<u8>) -> Self {
        Self {
            da,
            sa,
            fc: new_slave_response_fc(),
            du,
        }
    }

    pub fn to_fdl(&self) -> fdl::Telegram {
        build_fdl(self.da, self.sa, self.fc, None, None, self.du.clone())
    }
}

/// `Global_Control` telegram (master to multicast address).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GlobalControl {
    pub da: u8,
    pub sa: u8,
    pub fc: fdl::FunctionCode,
    pub control_command: ControlCommand,
    /// Selected groups; `0` addresses all slaves.
    pub group_select: u8,
}

impl GlobalControl {
    pub fn new(da: u8, sa: u8) -> Self {
        Self {
            da,
            sa,
            fc: new_request_fc(fdl::RequestType::SdnHigh),
            control_command: ControlCommand::empty(),
            group_select: 0,
        }
    }

    fn from_parts(da: u8, sa: u8, fc: fdl::FunctionCode, du: &[u8]) -> Result<Self, DpError> {
        if du.len() < 2 {
            return Err(DpError::InvalidTelegram("Global_Control"));
        }
        Ok(Self {
            da,
            sa,
            fc,
            control_command: ControlCommand::from_bits_retain(du[0]),
            group_select: du[1],
        })
    }

    pub fn to_fdl(&self) -> fdl::Telegram {
        build_fdl(
            self.da,
            self.sa,
            self.fc,
            Some(consts::DSAP_GLOBAL_CONTROL),
            Some(consts::SSAP_MS0),
            vec![self.control_command.bits(), self.group_select],
        )
    }
}

/// A decoded DP service telegram.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum DpTelegram {
    SlaveDiagReq(SlaveDiagRequest),
    SlaveDiagCon(SlaveDiagConfirm),
    SetPrmReq(SetPrmRequest),
    ChkCfgReq(ChkCfgRequest),
    GetCfgReq(GetCfgRequest),
    GetCfgCon(GetCfgConfirm),
    DataExchangeReq(DataExchangeRequest),
    DataExchangeCon(DataExchangeConfirm),
    GlobalControl(GlobalControl),
}

impl DpTelegram {
    /// Encode this DP service into its FDL telegram.
    pub fn to_fdl(&self) -> fdl::Telegram {
        match self {
            DpTelegram::SlaveDiagReq(t) => t.to_fdl(),
            DpTelegram::SlaveDiagCon(t) => t.to_fdl(),
            DpTelegram::SetPrmReq(t) => t.to_fdl(),
            DpTelegram::ChkCfgReq(t) => t.to_fdl(),
            DpTelegram::GetCfgReq(t) => t.to_fdl(),
            DpTelegram::GetCfgCon(t) => t.to_fdl(),
            DpTelegram::DataExchangeReq(t) => t.to_fdl(),
            DpTelegram::DataExchangeCon(t) => t.to_fdl(),
            DpTelegram::GlobalControl(t) => t.to_fdl(),
        }
    }

    /// Decode a DP service from an FDL telegram.
    ///
    /// `this_is_master` selects the dispatch direction: a master expects
    /// confirmations on its MS0 SAP, a slave expects the initialization
    /// requests.
    pub fn from_fdl(telegram: fdl::Telegram, this_is_master: bool) -> Result<DpTelegram, DpError> {
        let (da, sa, fc, dae, sae, du) = match telegram {
            fdl::Telegram::Sd1(t) => (t.da, t.sa, t.fc, Vec::new(), Vec::new(), Vec::new()),
            fdl::Telegram::Sd2(t) => (t.da, t.sa, t.fc, t.dae, t.sae, t.du),
            fdl::Telegram::Sd3(t) => (t.da, t.sa, t.fc, t.dae, t.sae, t.du),
            fdl::Telegram::Sc | fdl::Telegram::Sd4(_) => return Err(DpError::NotADataTelegram),
        };

        let dsap = extract_sap(&dae);
        let ssap = extract_sap(&sae);

        let Some(dsap) = dsap else {
            if ssap.is_some() {
                return Err(DpError::SsapWithoutDsap);
            }
            return if fc.is_request() {
                Ok(DpTelegram::DataExchangeReq(DataExchangeRequest {
                    da,
                    sa,
                    fc,
                    du,
                }))
            } else {
                Ok(DpTelegram::DataExchangeCon(DataExchangeConfirm {
                    da,
                    sa,
                    fc,
                    du,
                }))
            };
        };
        let Some(ssap) = ssap else {
            return Err(DpError::DsapWithoutSsap);
        };

        if this_is_master {
            if dsap != consts::SSAP_MS0 {
                return Err(DpError::UnknownDsap(dsap));
            }
            match ssap {
                consts::DSAP_SLAVE_DIAG => {
                    SlaveDiagConfirm::from_parts(da, sa, fc, &du).map(DpTelegram::SlaveDiagCon)
                }
                consts::DSAP_GET_CFG => Ok(DpTelegram::GetCfgCon(GetCfgConfirm {
                    da,
                    sa,
                    fc,
                    config: du,
                })),
                _ => Err(DpError::UnknownSsap(ssap)),
            }
        } else {
            if ssap != consts::SSAP_MS0 {
                return Err(DpError::UnknownSsap(ssap));
            }
            match dsap {
                consts::DSAP_SLAVE_DIAG => Ok(DpTelegram::SlaveDiagReq(SlaveDiagRequest {
                    da,
                    sa,
                    fc,
                })),
                consts::DSAP_SET_PRM => {
                    SetPrmRequest::from_parts(da, sa, fc, &du).map(DpTelegram::SetPrmReq)
                }
                consts::DSAP_CHK_CFG => {
                    ChkCfgRequest::from_parts(da, sa, fc, &du).map(DpTelegram::ChkCfgReq)
                }
                consts::DSAP_GLOBAL_CONTROL => {
                    GlobalControl::from_parts(da, sa, fc, &du).map(DpTelegram::GlobalControl)
                }
                _ => Err(DpError::UnknownDsap(dsap)),
            }
        }
    }

    pub fn destination_address(&self) -> u8 {
        match self {
            DpTelegram::SlaveDiagReq(t) => t.da,
            DpTelegram::SlaveDiagCon(t) => t.da,
            DpTelegram::SetPrmReq(t) => t.da,
            DpTelegram::ChkCfgReq(t) => t.da,
            DpTelegram::GetCfgReq(t) => t.da,
            DpTelegram::GetCfgCon(t) => t.da,
            DpTelegram::DataExchangeReq(t) => t.da,
            DpTelegram::DataExchangeCon(t) => t.da,
            DpTelegram::GlobalControl(t) => t.da,
        }
    }

    pub fn source_address(&self) -> u8 {
        match self {
            DpTelegram::SlaveDiagReq(t) => t.sa,
            DpTelegram::SlaveDiagCon(t) => t.sa,
            DpTelegram::SetPrmReq(t) => t.sa,
            DpTelegram::ChkCfgReq(t) => t.sa,
            DpTelegram::GetCfgReq(t) => t.sa,
            DpTelegram::GetCfgCon(t) => t.sa,
            DpTelegram::DataExchangeReq(t) => t.sa,
            DpTelegram::DataExchangeCon(t) => t.sa,
            DpTelegram::GlobalControl(t) => t.sa,
        }
    }

    pub fn function_code(&self) -> fdl::FunctionCode {
        match self {
            DpTelegram::SlaveDiagReq(t) => t.fc,
            DpTelegram::SlaveDiagCon(t) => t.fc,
            DpTelegram::SetPrmReq(t) => t.fc,
            DpTelegram::ChkCfgReq(t) => t.fc,
            DpTelegram::GetCfgReq(t) => t.fc,
            DpTelegram::GetCfgCon(t) => t.fc,
            DpTelegram::DataExchangeReq(t) => t.fc,
            DpTelegram::DataExchangeCon(t) => t.fc,
            DpTelegram::GlobalControl(t) => t.fc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn roundtrip(telegram: DpTelegram, this_is_master: bool) {
        let encoded = telegram.to_fdl();
        let mut buffer = [0u8; 256];
        let length = encoded.serialize(&mut buffer).unwrap();
        let (decoded_fdl, _) = fdl::Telegram::deserialize(&buffer[..length])
            .unwrap()
            .unwrap();
        let decoded = DpTelegram::from_fdl(decoded_fdl, this_is_master).unwrap();
        assert_eq!(decoded, telegram);
    }

    #[test]
    fn slave_diag_request_wire_format() {
        let req = SlaveDiagRequest::new(8, 2);
        let mut buffer = [0u8; 256];
        let length = req.to_fdl().serialize(&mut buffer).unwrap();
        // SD2 with LE=5: DA/SA carry the extension bit, DSAP 60, SSAP 62.
        assert_eq!(
            &buffer[..length],
            &[0x68, 0x05, 0x05, 0x68, 0x88, 0x82, 0x4D, 0x3C, 0x3E, 0xD1, 0x16]
        );
    }

    #[test]
    fn slave_diag_confirm_roundtrip() {
        let mut con = SlaveDiagConfirm::new(2, 8);
        con.status_2 |= DiagStatus2::ALWAYS_ONE;
        con.master_address = 2;
        con.ident_number = 0x4224;
        roundtrip(DpTelegram::SlaveDiagCon(con.clone()), true);

        assert!(con.is_ready_data_ex());
        assert!(!con.needs_new_prm_cfg());

        con.status_1 |= DiagStatus1::PRM_FAULT;
        assert!(con.needs_new_prm_cfg());
        assert!(!con.is_ready_data_ex());
    }

    #[test]
    fn slave_diag_confirm_with_ext_diag() {
        let mut con = SlaveDiagConfirm::new(2, 8);
        con.status_1 |= DiagStatus1::EXT_DIAG;
        con.ext_diag = vec![0x42, 0x08, 0x00];
        roundtrip(DpTelegram::SlaveDiagCon(con), true);
    }

    #[test]
    fn set_prm_du_layout() {
        let mut prm = SetPrmRequest::new(8, 2);
        prm.ident_number = 0x4224;
        prm.group_ident = 0x01;
        prm.set_watchdog(5000).unwrap();
        prm.user_prm_data = vec![0xDE, 0xAD];

        let encoded = prm.to_fdl();
        match &encoded {
            fdl::Telegram::Sd2(t) => {
                assert_eq!(t.dae, vec![consts::DSAP_SET_PRM]);
                assert_eq!(t.sae, vec![consts::SSAP_MS0]);
                assert_eq!(
                    t.du,
                    vec![0x88, 250, 2, 0, 0x42, 0x24, 0x01, 0xDE, 0xAD]
                );
            }
            _ => panic!("Set_Prm did not encode as SD2"),
        }
        roundtrip(DpTelegram::SetPrmReq(prm), false);
    }

    #[rstest]
    #[case(10)]
    #[case(100)]
    #[case(300)]
    #[case(5000)]
    #[case(65025)]
    fn watchdog_factors(#[case] ms: u32) {
        let mut prm = SetPrmRequest::new(8, 2);
        prm.set_watchdog(ms).unwrap();
        let (f1, f2) = (u32::from(prm.wd_fact_1), u32::from(prm.wd_fact_2));
        assert!((1..=255).contains(&f1));
        assert!((1..=255).contains(&f2));
        assert!(f1 * f2 * 10 >= ms);
        assert!((f1 - 1) * f2 * 10 < ms);
    }

    #[test]
    fn watchdog_disable_and_overflow() {
        let mut prm = SetPrmRequest::new(8, 2);
        prm.set_watchdog(1000).unwrap();
        assert!(prm.station_status.contains(StationStatus::WATCHDOG_ON));
        prm.set_watchdog(0).unwrap();
        assert!(!prm.station_status.contains(StationStatus::WATCHDOG_ON));

        assert!(matches!(
            prm.set_watchdog(u32::MAX),
            Err(DpError::WatchdogOutOfRange(_))
        ));
    }

    #[test]
    fn dpv1_prm_override() {
        let mut prm = SetPrmRequest::new(8, 2);
        prm.user_prm_data = vec![0x00, 0xFF, 0x0F, 0x77];
        prm.apply_dpv1_override(&[0x80, 0x0F, 0xFF], &[0x80, 0x05, 0x10])
            .unwrap();
        assert_eq!(prm.user_prm_data, vec![0x80, 0xF5, 0x10, 0x77]);

        prm.user_prm_data = vec![0x00];
        assert!(matches!(
            prm.apply_dpv1_override(&[0; 3], &[0; 3]),
            Err(DpError::Dpv1PrmTooShort)
        ));
    }

    #[test]
    fn chk_cfg_roundtrip_with_spec_elements() {
        let mut cfg = ChkCfgRequest::new(8, 2);
        cfg.cfg_data.push(CfgDataElement::new(
            CfgDataElement::ID_TYPE_IN | 0x01,
            Vec::new(),
        ));
        cfg.cfg_data.push(CfgDataElement::new(
            CfgDataElement::ID_TYPE_SPEC | 0x02,
            vec![0x40, 0x80],
        ));
        roundtrip(DpTelegram::ChkCfgReq(cfg), false);
    }

    #[test]
    fn data_exchange_roundtrip() {
        roundtrip(
            DpTelegram::DataExchangeReq(DataExchangeRequest::new(8, 2, vec![0x5A])),
            false,
        );
        roundtrip(
            DpTelegram::DataExchangeCon(DataExchangeConfirm::new(2, 8, vec![0xA5])),
            true,
        );
    }

    #[test]
    fn global_control_roundtrip() {
        let mut gc = GlobalControl::new(consts::ADDRESS_MCAST, 2);
        gc.control_command |= ControlCommand::SYNC;
        gc.group_select = 0x81;
        roundtrip(DpTelegram::GlobalControl(gc), false);
    }

    #[test]
    fn dispatch_errors() {
        // SSAP present without DSAP
        let t = fdl::Telegram::Sd2(fdl::TelegramSd2 {
            da: 2,
            sa: 8,
            fc: new_slave_response_fc(),
            dae: vec![],
            sae: vec![consts::DSAP_SLAVE_DIAG],
            du: vec![],
        });
        assert!(matches!(
            DpTelegram::from_fdl(t, true),
            Err(DpError::SsapWithoutDsap)
        ));

        // Unknown SSAP towards a master
        let t = fdl::Telegram::Sd2(fdl::TelegramSd2 {
            da: 2,
            sa: 8,
            fc: new_slave_response_fc(),
            dae: vec![consts::SSAP_MS0],
            sae: vec![consts::DSAP_SET_PRM],
            du: vec![],
        });
        assert!(matches!(
            DpTelegram::from_fdl(t, true),
            Err(DpError::UnknownSsap(61))
        ));
    }

    #[test]
    fn fdl_status_confirm_passes_as_data_exchange() {
        // An FDL status response (SD1, no SAPs) dispatches as an empty
        // Data_Exchange confirmation and keeps its function code.
        let t = fdl::Telegram::Sd1(fdl::TelegramSd1 {
            da: 2,
            sa: 8,
            fc: fdl::FunctionCode::Response {
                state: fdl::ResponseState::Slave,
                status: fdl::ResponseStatus::Ok,
            },
        });
        match DpTelegram::from_fdl(t, true).unwrap() {
            DpTelegram::DataExchangeCon(con) => {
                assert_eq!(con.du, Vec::<u8>::new());
                assert_eq!(
                    con.fc.response_status(),
                    Some(fdl::ResponseStatus::Ok)
                );
            }
            other => panic!("unexpected dispatch: {other:?}"),
        }
    }
}
