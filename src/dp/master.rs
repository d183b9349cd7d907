//! The DP master engine.

use crate::consts;
use crate::dp::slave::Slave;
use crate::dp::{
    ControlCommand, DpError, DpTelegram, GlobalControl, Reception, SlaveDescriptor,
};
use crate::dp::transceiver::DpTransceiver;
use crate::fdl;
use crate::phy::{Phy, PhyDriver};
use crate::time::{Duration, Instant};

/// Maximum DU octets of a DP service telegram after the two SAP octets.
const MAX_SERVICE_DU: usize = 244;
/// Fixed header octets of a `Set_Prm` request ahead of the `User_Prm_Data`.
const SET_PRM_HEADER_LEN: usize = 7;

/// DP master class.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum MasterClass {
    /// Class 1: cyclic I/O data exchange.
    Class1 = 1,
    /// Class 2: engineering/diagnosis.
    Class2 = 2,
}

/// Configuration of a [`DpMaster`].
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MasterParameters {
    /// Station address of this master (0..=126).
    pub address: u8,
    pub class: MasterClass,
    pub baudrate: crate::Baudrate,
}

impl Default for MasterParameters {
    fn default() -> Self {
        Self {
            address: 1,
            class: MasterClass::Class1,
            baudrate: crate::Baudrate::B19200,
        }
    }
}

/// Handle referring to a slave registered with a [`DpMaster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlaveHandle {
    address: u8,
}

impl SlaveHandle {
    #[inline(always)]
    pub fn address(self) -> u8 {
        self.address
    }
}

impl core::fmt::Display for SlaveHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Slave {}", self.address)
    }
}

/// Shared bus access for the state machine handlers: the transceiver stack
/// plus the master-global back-off bookkeeping.
pub(crate) struct MasterBus<D> {
    pub(crate) trans: DpTransceiver<D>,
    address: u8,
    slow_down_until: Option<Instant>,
    slow_down_factor: u32,
}

impl<D: PhyDriver> MasterBus<D> {
    #[inline(always)]
    pub(crate) fn address(&self) -> u8 {
        self.address
    }

    /// A severe communication error occurred; slow the engine down.
    ///
    /// The back-off is `10 ms * k` where `k` doubles on consecutive errors
    /// up to a cap of 10.
    pub(crate) fn slow_down(&mut self, now: Instant) {
        let k = self.slow_down_factor;
        self.slow_down_until = Some(now + Duration::from_millis(10) * k);
        log::debug!("Master: slow down factor = {}", k);
        self.slow_down_factor = (k * 2).min(10);
    }

    pub(crate) fn reset_slow_down(&mut self) {
        self.slow_down_factor = 1;
    }
}

/// The DP class 1 master.
///
/// The master owns the PHY and all registered slaves.  Call
/// [`run()`][`DpMaster::run`] in a tight loop; every call services at most
/// one slave and never blocks.
pub struct DpMaster<D> {
    bus: MasterBus<D>,
    class: MasterClass,
    slaves: Vec<Slave>,
    next_slave: usize,
    /// FCB context of the multicast pseudo-peer used for `Global_Control`.
    mcast_fcb: fdl::FcbContext,
}

impl<D: PhyDriver> DpMaster<D> {
    /// Create a new master on top of the given PHY driver.
    ///
    /// This configures the PHY line rate and restricts reception to this
    /// master's address and the multicast address.
    pub fn new(driver: D, parameters: MasterParameters) -> Result<Self, DpError> {
        if parameters.address >= consts::ADDRESS_MCAST {
            return Err(DpError::InvalidMasterAddress(parameters.address));
        }

        let mut phy = Phy::new(driver);
        phy.set_config(parameters.baudrate)?;

        let mut fdl = fdl::FdlTransceiver::new(phy);
        fdl.set_rx_filter(Some(&[parameters.address, consts::ADDRESS_MCAST]));

        log::info!(
            "DPM{}: master at address {} ({} bit/s)",
            parameters.class as u8,
            parameters.address,
            parameters.baudrate.to_rate()
        );

        Ok(Self {
            bus: MasterBus {
                trans: DpTransceiver::new(fdl, true),
                address: parameters.address,
                slow_down_until: None,
                slow_down_factor: 1,
            },
            class: parameters.class,
            slaves: Vec::new(),
            next_slave: 0,
            mcast_fcb: fdl::FcbContext::new(),
        })
    }

    #[inline(always)]
    pub fn master_address(&self) -> u8 {
        self.bus.address
    }

    #[inline(always)]
    pub fn class(&self) -> MasterClass {
        self.class
    }

    /// Register a slave.
    pub fn add_slave(&mut self, desc: SlaveDescriptor) -> Result<SlaveHandle, DpError> {
        let address = desc.address();
        if !(1..=125).contains(&address) {
            return Err(DpError::InvalidSlaveAddress(address));
        }
        if desc.input_size == 0 {
            return Err(DpError::InputSizeZero { address });
        }
        for (direction, size) in [("input", desc.input_size), ("output", desc.output_size)] {
            if size > 246 {
                return Err(DpError::DataSizeOutOfRange {
                    address,
                    direction,
                    size,
                });
            }
        }
        // The Set_Prm and Chk_Cfg templates must fit into an SD2 telegram:
        // 246 effective octets, of which two are taken by the SAPs.
        let prm_len = desc.user_prm_data_len();
        if SET_PRM_HEADER_LEN + prm_len > MAX_SERVICE_DU {
            return Err(DpError::UserPrmDataTooLong {
                address,
                len: prm_len,
            });
        }
        let cfg_len = desc.cfg_data_len();
        if cfg_len > MAX_SERVICE_DU {
            return Err(DpError::CfgDataTooLong {
                address,
                len: cfg_len,
            });
        }
        if self.slaves.iter().any(|s| s.address() == address) {
            return Err(DpError::SlaveAlreadyRegistered(address));
        }

        self.slaves.push(Slave::new(desc));
        // The round-robin order is sorted by address.
        self.slaves.sort_by_key(|s| s.address());
        self.next_slave = 0;

        Ok(SlaveHandle { address })
    }

    /// Addresses of all registered slaves, in round-robin order.
    pub fn slave_handles(&self) -> Vec<SlaveHandle> {
        self.slaves
            .iter()
            .map(|s| SlaveHandle {
                address: s.address(),
            })
            .collect()
    }

    fn slave(&self, handle: SlaveHandle) -> &Slave {
        self.slaves
            .iter()
            .find(|s| s.address() == handle.address)
            .expect("handle does not refer to a registered slave")
    }

    fn slave_mut(&mut self, handle: SlaveHandle) -> &mut Slave {
        self.slaves
            .iter_mut()
            .find(|s| s.address() == handle.address)
            .expect("handle does not refer to a registered slave")
    }

    pub fn slave_descriptor(&self, handle: SlaveHandle) -> &SlaveDescriptor {
        &self.slave(handle).desc
    }

    /// Run one tick of the master: dispatch received telegrams and service
    /// the next slave in round-robin order.
    ///
    /// Returns the handle of the serviced slave, if any.
    pub fn run(&mut self, now: Instant) -> Result<Option<SlaveHandle>, DpError> {
        self.poll_rx(now);

        if let Some(until) = self.bus.slow_down_until {
            // Severe error back-off is active; do not run the state
            // machine until it has passed.
            if now < until {
                return Ok(None);
            }
            self.bus.slow_down_until = None;
        }

        if self.slaves.is_empty() {
            return Ok(None);
        }

        let index = self.next_slave;
        self.next_slave = (index + 1) % self.slaves.len();

        let slave = &mut self.slaves[index];
        let handle = SlaveHandle {
            address: slave.address(),
        };
        let from_slave = slave.run(&mut self.bus, now)?;

        if let Some(data) = from_slave {
            if data.len() == slave.desc.output_size {
                slave.from_slave_data = Some(data);
            } else {
                log::error!(
                    "Slave {}: received data size ({} bytes) does not match \
                     the configured output size ({} bytes)",
                    handle.address,
                    data.len(),
                    slave.desc.output_size
                );
                slave.fault_deb.fault();
            }
        }

        Ok(Some(handle))
    }

    fn poll_rx(&mut self, now: Instant) {
        let reception = match self.bus.trans.poll(now, Duration::ZERO) {
            Err(e) => {
                log::debug!("Master: RX error: {}", e);
                return;
            }
            Ok(None) => return,
            Ok(Some(reception)) => reception,
        };

        match reception {
            Reception::Token { da, sa } => {
                // Token handling is not implemented; this master assumes to
                // be the only active station.
                log::trace!("Master: ignoring token telegram {} -> {}", sa, da);
            }
            Reception::ShortConfirmation => {
                // The short confirmation carries no addresses.  Latch it on
                // every slave; only the one awaiting it will consume it.
                for slave in &mut self.slaves {
                    slave.note_short_ack();
                }
            }
            Reception::Foreign(telegram) => {
                log::debug!(
                    "Master: received telegram for foreign station: {:?}",
                    telegram
                );
            }
            Reception::Undispatchable { sa, error } => {
                log::debug!(
                    "Master: cannot dispatch telegram from station {}: {}",
                    sa,
                    error
                );
                if let Some(slave) = self.slaves.iter_mut().find(|s| s.address() == sa) {
                    slave.fault_deb.fault();
                }
            }
            Reception::Telegram(telegram) => {
                let da = telegram.destination_address();
                if da == consts::ADDRESS_MCAST {
                    self.handle_mcast_telegram(telegram);
                } else if da == self.bus.address {
                    let sa = telegram.source_address();
                    match self.slaves.iter_mut().find(|s| s.address() == sa) {
                        Some(slave) => {
                            slave.push_rx(telegram);
                            slave.handle_reply_fcb();
                        }
                        None => {
                            log::debug!(
                                "Master: received telegram from unknown station {}: {:?}",
                                sa,
                                telegram
                            );
                        }
                    }
                } else {
                    log::debug!(
                        "Master: received telegram for foreign station {}: {:?}",
                        da,
                        telegram
                    );
                }
            }
        }
    }

    fn handle_mcast_telegram(&mut self, telegram: DpTelegram) {
        // Incoming multicast (e.g. Global_Control from another master) is
        // logged but not dispatched further.
        log::debug!("Master: received multicast telegram: {:?}", telegram);
    }

    /// Set the out-data that will be sent to the slave with the next
    /// `Data_Exchange` request.
    pub fn set_master_out_data(
        &mut self,
        handle: SlaveHandle,
        data: Vec<u8>,
    ) -> Result<(), DpError> {
        let slave = self.slave_mut(handle);
        if data.len() != slave.desc.input_size {
            return Err(DpError::DataSizeMismatch {
                address: handle.address,
                direction: "input",
                got: data.len(),
                want: slave.desc.input_size,
            });
        }
        slave.set_out_data(data);
        Ok(())
    }

    /// Take the latest received in-data of the slave, if any.
    pub fn take_master_in_data(&mut self, handle: SlaveHandle) -> Option<Vec<u8>> {
        self.slave_mut(handle).take_in_data()
    }

    /// Whether the slave is in the process of being connected/configured.
    pub fn is_connecting(&self, handle: SlaveHandle) -> bool {
        self.slave(handle).is_connecting()
    }

    /// Whether the slave is fully connected and exchanging data.
    pub fn is_connected(&self, handle: SlaveHandle) -> bool {
        self.slave(handle).is_connected()
    }

    fn global_control(
        &mut self,
        now: Instant,
        command: ControlCommand,
        group_mask: u8,
    ) -> Result<(), DpError> {
        let mut gc = GlobalControl::new(consts::ADDRESS_MCAST, self.bus.address);
        gc.control_command |= command;
        gc.group_select = group_mask;
        self.bus
            .trans
            .send(now, &mut self.mcast_fcb, &DpTelegram::GlobalControl(gc))?;
        Ok(())
    }

    /// Set SYNC-mode on the given group mask (0 addresses all slaves).
    pub fn sync_mode(&mut self, now: Instant, group_mask: u8) -> Result<(), DpError> {
        self.global_control(now, ControlCommand::SYNC, group_mask)
    }

    /// Cancel SYNC-mode on the given group mask.
    pub fn sync_mode_cancel(&mut self, now: Instant, group_mask: u8) -> Result<(), DpError> {
        self.global_control(now, ControlCommand::UNSYNC, group_mask)
    }

    /// Set FREEZE-mode on the given group mask (0 addresses all slaves).
    pub fn freeze_mode(&mut self, now: Instant, group_mask: u8) -> Result<(), DpError> {
        self.global_control(now, ControlCommand::FREEZE, group_mask)
    }

    /// Cancel FREEZE-mode on the given group mask.
    pub fn freeze_mode_cancel(&mut self, now: Instant, group_mask: u8) -> Result<(), DpError> {
        self.global_control(now, ControlCommand::UNFREEZE, group_mask)
    }

    /// Shut the master down by closing the PHY.
    pub fn destroy(mut self) {
        self.bus.trans.fdl_mut().close();
    }

    /// Direct access to the PHY driver.
    pub fn phy_driver_mut(&mut self) -> &mut D {
        self.bus.trans.fdl_mut().phy_mut().driver_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::PhyError;

    #[derive(Default)]
    struct NullPhy;

    impl PhyDriver for NullPhy {
        fn transmit(&mut self, _data: &[u8], _srd: bool) -> Result<(), PhyError> {
            Ok(())
        }

        fn receive(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>, PhyError> {
            Ok(None)
        }

        fn apply_baudrate(&mut self, _baudrate: crate::Baudrate) -> Result<(), PhyError> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    fn new_master() -> DpMaster<NullPhy> {
        DpMaster::new(NullPhy, MasterParameters {
            address: 2,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn add_slave_validations() {
        crate::test_utils::prepare_test_logger();
        let mut master = new_master();

        let mut desc = SlaveDescriptor::new(8, 0x4224);
        desc.input_size = 1;
        desc.output_size = 1;
        master.add_slave(desc.clone()).unwrap();

        // Duplicate address
        assert!(matches!(
            master.add_slave(desc),
            Err(DpError::SlaveAlreadyRegistered(8))
        ));

        // Address out of range
        let mut desc = SlaveDescriptor::new(126, 0x1234);
        desc.input_size = 1;
        assert!(matches!(
            master.add_slave(desc),
            Err(DpError::InvalidSlaveAddress(126))
        ));

        // input_size = 0 is not supported
        let desc = SlaveDescriptor::new(9, 0x1234);
        assert!(matches!(
            master.add_slave(desc),
            Err(DpError::InputSizeZero { address: 9 })
        ));

        // Oversized I/O
        let mut desc = SlaveDescriptor::new(9, 0x1234);
        desc.input_size = 247;
        assert!(matches!(
            master.add_slave(desc),
            Err(DpError::DataSizeOutOfRange { .. })
        ));

        // A Set_Prm template that would not fit into an SD2 telegram
        let mut desc = SlaveDescriptor::new(9, 0x1234);
        desc.input_size = 1;
        desc.set_user_prm_data(vec![0x00; 238]);
        assert!(matches!(
            master.add_slave(desc),
            Err(DpError::UserPrmDataTooLong {
                address: 9,
                len: 238,
            })
        ));

        // A Chk_Cfg template that would not fit into an SD2 telegram
        let mut desc = SlaveDescriptor::new(9, 0x1234);
        desc.input_size = 1;
        desc.set_cfg_data(vec![
            crate::dp::CfgDataElement::new(
                crate::dp::CfgDataElement::ID_TYPE_SPEC | 0x0F,
                vec![0x00; 15],
            );
            16
        ]);
        assert!(matches!(
            master.add_slave(desc),
            Err(DpError::CfgDataTooLong { address: 9, .. })
        ));
    }

    #[test]
    fn out_data_size_is_validated() {
        crate::test_utils::prepare_test_logger();
        let mut master = new_master();

        let mut desc = SlaveDescriptor::new(8, 0x4224);
        desc.input_size = 2;
        desc.output_size = 1;
        let handle = master.add_slave(desc).unwrap();

        assert!(matches!(
            master.set_master_out_data(handle, vec![0x01]),
            Err(DpError::DataSizeMismatch {
                address: 8,
                got: 1,
                want: 2,
                ..
            })
        ));
        master.set_master_out_data(handle, vec![0x01, 0x02]).unwrap();
    }

    #[test]
    fn round_robin_order_is_sorted_by_address() {
        crate::test_utils::prepare_test_logger();
        let mut master = new_master();

        for address in [40, 8, 19] {
            let mut desc = SlaveDescriptor::new(address, 0x1111);
            desc.input_size = 1;
            master.add_slave(desc).unwrap();
        }

        let addresses: Vec<u8> = master
            .slave_handles()
            .iter()
            .map(|h| h.address())
            .collect();
        assert_eq!(addresses, vec![8, 19, 40]);

        // Each tick services the next slave in that order.
        let mut serviced = Vec::new();
        let mut now = Instant::ZERO;
        for _ in 0..6 {
            serviced.push(master.run(now).unwrap().unwrap().address());
            now += Duration::from_millis(1);
        }
        assert_eq!(serviced, vec![8, 19, 40, 8, 19, 40]);
    }
}
