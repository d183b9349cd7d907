//! DP - Decentralized Periphery (PROFIBUS layer 7)
//!
//! This module implements the DP application layer.  The main component is
//! the [`DpMaster`] type which owns the registered slaves and drives each of
//! them from discovery through parameterization and configuration check
//! into cyclic `Data_Exchange`.
//!
//! Slaves are registered with a [`SlaveDescriptor`], which is best built
//! from the device's GSD file via the `gsd-parser` crate.
mod master;
mod slave;
mod telegram;
mod transceiver;

pub use master::{DpMaster, MasterClass, MasterParameters, SlaveHandle};
pub use slave::{DpSlaveState, FaultDebouncer, SlaveDescriptor};
pub use telegram::{
    dpv1_prm, CfgDataElement, ChkCfgRequest, ControlCommand, DataExchangeConfirm,
    DataExchangeRequest, DiagStatus1, DiagStatus2, DiagStatus3, DpTelegram, GetCfgConfirm,
    GetCfgRequest, GlobalControl, SetPrmRequest, SlaveDiagConfirm, SlaveDiagRequest,
    StationStatus,
};
pub use transceiver::{DpTransceiver, Reception};

/// Errors of the DP application layer.
///
/// Dispatch errors are recovered by dropping the telegram in question and
/// counting a fault against the slave it came from.  Configuration errors
/// are surfaced to the caller before the engine touches the bus.
#[derive(Debug, thiserror::Error)]
pub enum DpError {
    /// An incoming telegram carried a source SAP but no destination SAP.
    #[error("telegram with SSAP but without DSAP")]
    SsapWithoutDsap,
    /// An incoming telegram carried a destination SAP but no source SAP.
    #[error("telegram with DSAP but without SSAP")]
    DsapWithoutSsap,
    #[error("unknown DSAP {0}")]
    UnknownDsap(u8),
    #[error("unknown SSAP {0}")]
    UnknownSsap(u8),
    /// Token and short confirmation telegrams carry no DP content.
    #[error("not a DP data telegram")]
    NotADataTelegram,
    #[error("invalid {0} telegram format")]
    InvalidTelegram(&'static str),

    /// The slave answered `Data_Exchange` with "no service activated" (RS).
    #[error("service not active on slave {address}")]
    ServiceNotActive { address: u8 },

    #[error("invalid slave address {0}")]
    InvalidSlaveAddress(u8),
    #[error("invalid master address {0}")]
    InvalidMasterAddress(u8),
    #[error("slave {0} is already registered")]
    SlaveAlreadyRegistered(u8),
    #[error("slave {address}: {direction} size {size} exceeds 246 bytes")]
    DataSizeOutOfRange {
        address: u8,
        direction: &'static str,
        size: usize,
    },
    #[error("slave {address}: input_size=0 is not supported")]
    InputSizeZero { address: u8 },
    #[error("slave {address}: data size {got} does not match the configured {direction} size {want}")]
    DataSizeMismatch {
        address: u8,
        direction: &'static str,
        got: usize,
        want: usize,
    },
    #[error("slave {address}: User_Prm_Data length {len} exceeds the telegram capacity")]
    UserPrmDataTooLong { address: u8, len: usize },
    #[error("slave {address}: Chk_Cfg data length {len} exceeds the telegram capacity")]
    CfgDataTooLong { address: u8, len: usize },
    #[error("watchdog timeout {0} ms is out of range")]
    WatchdogOutOfRange(u32),
    #[error("DPV1 User_Prm_Data is shorter than 3 bytes")]
    Dpv1PrmTooShort,

    #[error(transparent)]
    Gsd(#[from] gsd_parser::GsdError),

    #[error(transparent)]
    Phy(#[from] crate::phy::PhyError),

    #[error(transparent)]
    Fdl(#[from] crate::fdl::FdlError),
}

impl From<crate::fdl::SendError> for DpError {
    fn from(e: crate::fdl::SendError) -> Self {
        match e {
            crate::fdl::SendError::Phy(e) => DpError::Phy(e),
            crate::fdl::SendError::Encode(e) => DpError::Fdl(e),
        }
    }
}
