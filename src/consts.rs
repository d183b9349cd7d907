//! PROFIBUS Constants

/// Start Delimiter 1 (telegram without data unit)
pub const SD1: u8 = 0x10;
/// Start Delimiter 2 (telegram with variable data unit)
pub const SD2: u8 = 0x68;
/// Start Delimiter 3 (telegram with fixed 8 octet data unit)
pub const SD3: u8 = 0xA2;
/// Start Delimiter 4 (token telegram)
pub const SD4: u8 = 0xDC;
/// End Delimiter
pub const ED: u8 = 0x16;
/// Short Confirmation
pub const SC: u8 = 0xE5;

/// Mask for the 7 bit station address value
pub const ADDRESS_MASK: u8 = 0x7F;
/// Address bit signalling that a DAE/SAE address extension is present
pub const ADDRESS_EXT: u8 = 0x80;
/// Multicast/broadcast station address
pub const ADDRESS_MCAST: u8 = 127;

/// Address extension bit: further extension octets follow
pub const AE_EXT: u8 = 0x80;
/// Address extension bit: this octet carries a segment address
pub const AE_SEGMENT: u8 = 0x40;
/// Address extension mask for the SAP/segment number
pub const AE_ADDRESS: u8 = 0x3F;

/// SSAP: DP master (class 2) to slave
pub const SSAP_MS2: u8 = 50;
/// SSAP: DP master (class 1) to slave
pub const SSAP_MS1: u8 = 51;
/// SSAP: master to master
pub const SSAP_MM: u8 = 54;
/// SSAP: master to slave
pub const SSAP_MS0: u8 = 62;

/// DSAP: Set_Slave_Adr service
pub const DSAP_SET_SLAVE_ADR: u8 = 55;
/// DSAP: Global_Control service
pub const DSAP_GLOBAL_CONTROL: u8 = 58;
/// DSAP: Get_Cfg service
pub const DSAP_GET_CFG: u8 = 59;
/// DSAP: Slave_Diag service
pub const DSAP_SLAVE_DIAG: u8 = 60;
/// DSAP: Set_Prm service
pub const DSAP_SET_PRM: u8 = 61;
/// DSAP: Chk_Cfg service
pub const DSAP_CHK_CFG: u8 = 62;
