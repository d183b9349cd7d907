//! Slave descriptor and the per-slave state machine.

use std::collections::VecDeque;

use crate::dp::master::MasterBus;
use crate::dp::{
    CfgDataElement, ChkCfgRequest, DataExchangeRequest, DpError, DpTelegram, SetPrmRequest,
    SlaveDiagRequest,
};
use crate::fdl;
use crate::phy::PhyDriver;
use crate::time::{Duration, Instant};

/// Deadline for the `FDL_Status` request during initialization.
const TIMEOUT_FDL_STATUS: Duration = Duration::from_millis(10);
/// Deadline for `Slave_Diag`, `Set_Prm` and `Chk_Cfg` requests.
const TIMEOUT_INIT_REQUEST: Duration = Duration::from_millis(50);
/// Deadline for a `Data_Exchange` request.
const TIMEOUT_DATA_EXCHANGE: Duration = Duration::from_millis(100);

/// Shortened state time limit when diagnostics are requested out of DX.
const TIME_LIMIT_DIAG_SHORT: Duration = Duration::from_millis(200);
/// Settle time before repeated DX faults escalate into a diagnosis cycle.
const DX_SETTLE_TIME: Duration = Duration::from_millis(200);

/// Bound of the per-slave receive queue.
const RX_QUEUE_LIMIT: usize = 8;

/// Saturating fault counter with hysteresis.
///
/// A fault weighs twice as much as a success: [`fault()`][Self::fault] adds
/// two, [`ok()`][Self::ok] subtracts one.  The exposed value is half the
/// internal count, rounded up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultDebouncer {
    count: u16,
}

impl Default for FaultDebouncer {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultDebouncer {
    const COUNT_MAX: u16 = 0xFFFF;

    pub fn new() -> Self {
        Self { count: 0 }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn fault(&mut self) -> u16 {
        if self.count < Self::COUNT_MAX - 2 {
            self.count += 2;
        }
        self.value()
    }

    pub fn ok(&mut self) -> u16 {
        self.count = self.count.saturating_sub(1);
        self.value()
    }

    pub fn value(&self) -> u16 {
        (self.count + 1) / 2
    }
}

/// Run time state of a DP slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DpSlaveState {
    /// Probe the station with `FDL_Status` requests.
    #[default]
    Init,
    /// Wait for the first `Slave_Diag` confirmation.
    WaitDiag,
    /// Wait for the `Set_Prm` acknowledgement.
    WaitPrm,
    /// Wait for the `Chk_Cfg` acknowledgement.
    WaitCfg,
    /// Request diagnosis until the slave reports readiness for DX.
    WaitDxReady,
    /// Cyclic `Data_Exchange`.
    DataExchange,
}

impl DpSlaveState {
    /// Time limit for staying in this state; exceeding it falls back to
    /// [`Init`][DpSlaveState::Init].
    fn default_time_limit(self) -> Option<Duration> {
        match self {
            DpSlaveState::Init => None,
            DpSlaveState::WaitDiag => Some(Duration::from_millis(1000)),
            DpSlaveState::WaitPrm => Some(Duration::from_millis(500)),
            DpSlaveState::WaitCfg => Some(Duration::from_millis(500)),
            DpSlaveState::WaitDxReady => Some(Duration::from_millis(1000)),
            DpSlaveState::DataExchange => Some(Duration::from_millis(500)),
        }
    }
}

impl core::fmt::Display for DpSlaveState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            DpSlaveState::Init => "Init",
            DpSlaveState::WaitDiag => "Wait for diag",
            DpSlaveState::WaitPrm => "Wait for Prm",
            DpSlaveState::WaitCfg => "Wait for Cfg",
            DpSlaveState::WaitDxReady => "Wait for DX ready",
            DpSlaveState::DataExchange => "Data_Exchange",
        };
        f.write_str(name)
    }
}

/// Static descriptor of a DP slave managed by the master.
///
/// The descriptor carries the prepared `Set_Prm` and `Chk_Cfg` templates.
/// All `set_*` configuration must happen before the slave is registered
/// with [`DpMaster::add_slave`][`crate::dp::DpMaster::add_slave`].
#[derive(Debug, Clone)]
pub struct SlaveDescriptor {
    /// Host-side name of this slave, for bookkeeping only.
    pub name: Option<String>,
    address: u8,
    ident_number: u16,
    /// Number of output bytes the slave consumes per DX cycle.
    pub input_size: usize,
    /// Number of input bytes the slave produces per DX cycle.
    pub output_size: usize,
    /// Request diagnosis every this many DX cycles (0 = never).
    pub diag_period: u32,
    set_prm: SetPrmRequest,
    chk_cfg: ChkCfgRequest,
}

impl SlaveDescriptor {
    pub fn new(address: u8, ident_number: u16) -> Self {
        let mut set_prm = SetPrmRequest::new(address, 0);
        set_prm.ident_number = ident_number;
        Self {
            name: None,
            address,
            ident_number,
            input_size: 0,
            output_size: 0,
            diag_period: 0,
            set_prm,
            chk_cfg: ChkCfgRequest::new(address, 0),
        }
    }

    /// Build a descriptor from an interpreted GSD file.
    ///
    /// The configuration check data and the `User_Prm_Data` are composed
    /// from the GSD's configured module set.  The I/O sizes still need to
    /// be set by the caller.
    pub fn from_gsd(address: u8, gsd: &gsd_parser::GsdInterpreter) -> Result<Self, DpError> {
        let mut desc = Self::new(address, gsd.ident_number()?);
        desc.set_cfg_data(
            gsd.cfg_data_elements()
                .iter()
                .map(CfgDataElement::from)
                .collect(),
        );
        desc.set_user_prm_data(gsd.user_prm_data(None)?);
        Ok(desc)
    }

    #[inline(always)]
    pub fn address(&self) -> u8 {
        self.address
    }

    #[inline(always)]
    pub fn ident_number(&self) -> u16 {
        self.ident_number
    }

    /// Enable/disable sync-mode.  Must be set before registration.
    pub fn set_sync_mode(&mut self, enabled: bool) {
        self.set_prm.set_sync_mode(enabled);
    }

    /// Enable/disable freeze-mode.  Must be set before registration.
    pub fn set_freeze_mode(&mut self, enabled: bool) {
        self.set_prm.set_freeze_mode(enabled);
    }

    /// Assign the slave to one or more groups.  Must be set before
    /// registration.
    pub fn set_group_mask(&mut self, group_mask: u8) {
        self.set_prm.group_ident = group_mask;
    }

    /// Set the slave watchdog timeout in milliseconds (0 disables it).
    pub fn set_watchdog(&mut self, timeout_ms: u32) -> Result<(), DpError> {
        self.set_prm.set_watchdog(timeout_ms)
    }

    /// Set the `User_Prm_Data` of the `Set_Prm` template.
    pub fn set_user_prm_data(&mut self, data: Vec<u8>) {
        self.set_prm.user_prm_data = data;
    }

    /// Set the configuration data elements of the `Chk_Cfg` template.
    pub fn set_cfg_data(&mut self, cfg_data: Vec<CfgDataElement>) {
        self.chk_cfg.cfg_data = cfg_data;
    }

    /// Length of the `User_Prm_Data` carried by the `Set_Prm` template.
    pub(crate) fn user_prm_data_len(&self) -> usize {
        self.set_prm.user_prm_data.len()
    }

    /// Encoded DU length of the `Chk_Cfg` template.
    pub(crate) fn cfg_data_len(&self) -> usize {
        self.chk_cfg
            .cfg_data
            .iter()
            .map(|element| 1 + element.length_bytes.len())
            .sum()
    }

    /// `Set_Prm` request with the master address patched in.
    fn set_prm_request(&self, master_address: u8) -> SetPrmRequest {
        let mut request = self.set_prm.clone();
        request.sa = master_address;
        request
    }

    /// `Chk_Cfg` request with the master address patched in.
    fn chk_cfg_request(&self, master_address: u8) -> ChkCfgRequest {
        let mut request = self.chk_cfg.clone();
        request.sa = master_address;
        request
    }
}

/// A registered slave: its descriptor plus all engine-internal run time
/// state.
#[derive(Debug)]
pub(crate) struct Slave {
    pub(crate) desc: SlaveDescriptor,

    state: DpSlaveState,
    next_state: DpSlaveState,
    prev_state: Option<DpSlaveState>,
    state_limit: Option<Duration>,
    state_deadline: Option<Instant>,

    fcb: fdl::FcbContext,
    pending_deadline: Option<Instant>,
    short_ack_received: bool,
    rx_queue: VecDeque<DpTelegram>,
    pub(crate) fault_deb: FaultDebouncer,

    dx_start: Instant,
    dx_count: u32,
    dx_cycle_running: bool,

    to_slave_data: Option<Vec<u8>>,
    pub(crate) from_slave_data: Option<Vec<u8>>,
}

impl Slave {
    pub(crate) fn new(desc: SlaveDescriptor) -> Self {
        Self {
            desc,
            state: DpSlaveState::Init,
            next_state: DpSlaveState::Init,
            prev_state: None,
            state_limit: None,
            state_deadline: None,
            fcb: fdl::FcbContext::new(),
            pending_deadline: None,
            short_ack_received: false,
            rx_queue: VecDeque::new(),
            fault_deb: FaultDebouncer::new(),
            dx_start: Instant::ZERO,
            dx_count: 0,
            dx_cycle_running: false,
            to_slave_data: None,
            from_slave_data: None,
        }
    }

    #[inline(always)]
    pub(crate) fn address(&self) -> u8 {
        self.desc.address()
    }

    /// The slave is being initialized but not yet exchanging data.
    pub(crate) fn is_connecting(&self) -> bool {
        !self.dx_cycle_running && self.state != DpSlaveState::Init
    }

    /// The slave is fully connected (cyclic DX or periodic diagnosis).
    pub(crate) fn is_connected(&self) -> bool {
        self.dx_cycle_running
    }

    pub(crate) fn set_out_data(&mut self, data: Vec<u8>) {
        self.to_slave_data = Some(data);
    }

    pub(crate) fn take_in_data(&mut self) -> Option<Vec<u8>> {
        self.from_slave_data.take()
    }

    pub(crate) fn note_short_ack(&mut self) {
        self.short_ack_received = true;
    }

    pub(crate) fn handle_reply_fcb(&mut self) {
        self.fcb.handle_reply();
    }

    pub(crate) fn push_rx(&mut self, telegram: DpTelegram) {
        if self.rx_queue.len() >= RX_QUEUE_LIMIT {
            log::warn!(
                "Slave {}: RX queue overflow, dropping oldest telegram",
                self.address()
            );
            self.rx_queue.pop_front();
        }
        self.rx_queue.push_back(telegram);
    }

    fn take_rx_queue(&mut self) -> Vec<DpTelegram> {
        self.rx_queue.drain(..).collect()
    }

    fn just_entered(&self) -> bool {
        self.prev_state != Some(self.state)
    }

    fn apply_state(&mut self) {
        self.prev_state = Some(self.state);
        self.state = self.next_state;
        if self.just_entered() {
            self.pending_deadline = None;
        }
    }

    fn set_state<D: PhyDriver>(
        &mut self,
        bus: &mut MasterBus<D>,
        now: Instant,
        state: DpSlaveState,
        limit_override: Option<Duration>,
    ) {
        if state == DpSlaveState::Init {
            self.dx_cycle_running = false;
        }
        self.next_state = state;
        self.state_limit = limit_override.or_else(|| state.default_time_limit());
        self.state_deadline = self.state_limit.map(|limit| now + limit);
        bus.trans.fdl_mut().clear_tx_queue(self.address());
        bus.trans.fdl_mut().release_bus(now);
    }

    fn restart_state_timeout(&mut self, now: Instant) {
        self.state_deadline = self.state_limit.map(|limit| now + limit);
    }

    fn state_timed_out(&self, now: Instant) -> bool {
        self.state_deadline.map(|d| now >= d).unwrap_or(false)
    }

    fn request_idle_or_expired(&self, now: Instant) -> bool {
        self.pending_deadline.map(|d| now >= d).unwrap_or(true)
    }

    fn request_expired(&self, now: Instant) -> bool {
        self.pending_deadline.map(|d| now >= d).unwrap_or(false)
    }

    fn send_dp<D: PhyDriver>(
        &mut self,
        bus: &mut MasterBus<D>,
        now: Instant,
        telegram: DpTelegram,
        timeout: Duration,
    ) -> bool {
        self.short_ack_received = false;
        match bus.trans.send(now, &mut self.fcb, &telegram) {
            Ok(()) => {
                bus.reset_slow_down();
                self.pending_deadline = Some(now + timeout);
                true
            }
            Err(e) => {
                self.pending_deadline = None;
                log::debug!("Slave {}: TX error: {}", self.address(), e);
                bus.slow_down(now);
                false
            }
        }
    }

    fn send_fdl<D: PhyDriver>(
        &mut self,
        bus: &mut MasterBus<D>,
        now: Instant,
        telegram: fdl::Telegram,
        timeout: Duration,
    ) -> bool {
        self.short_ack_received = false;
        match bus.trans.send_fdl(now, &mut self.fcb, telegram) {
            Ok(()) => {
                bus.reset_slow_down();
                self.pending_deadline = Some(now + timeout);
                true
            }
            Err(e) => {
                self.pending_deadline = None;
                log::debug!("Slave {}: TX error: {}", self.address(), e);
                bus.slow_down(now);
                false
            }
        }
    }

    /// Run one tick of the state machine.
    ///
    /// Returns the received DX in-data, if any arrived this tick.
    pub(crate) fn run<D: PhyDriver>(
        &mut self,
        bus: &mut MasterBus<D>,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, DpError> {
        let result = if self.state_timed_out(now) {
            log::debug!(
                "Slave {}: state machine timeout, reinitializing",
                self.address()
            );
            self.set_state(bus, now, DpSlaveState::Init, None);
            Ok(None)
        } else {
            let result = match self.state {
                DpSlaveState::Init => self.run_init(bus, now),
                DpSlaveState::WaitDiag => self.run_wait_diag(bus, now),
                DpSlaveState::WaitPrm => self.run_wait_prm(bus, now),
                DpSlaveState::WaitCfg => self.run_wait_cfg(bus, now),
                DpSlaveState::WaitDxReady => self.run_wait_dx_ready(bus, now),
                DpSlaveState::DataExchange => self.run_data_exchange(bus, now),
            };
            if self.next_state != self.state {
                log::debug!(
                    "Slave {}: state \"{}\" -> \"{}\"",
                    self.address(),
                    self.state,
                    self.next_state
                );
            }
            result
        };
        self.apply_state();
        result
    }

    fn run_init<D: PhyDriver>(
        &mut self,
        bus: &mut MasterBus<D>,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, DpError> {
        let address = self.address();
        if self.just_entered() {
            log::debug!("Slave {}: trying to initialize...", address);
            self.rx_queue.clear();
        } else {
            for telegram in self.take_rx_queue() {
                self.pending_deadline = None;
                match telegram.function_code() {
                    fdl::FunctionCode::Request { .. } => {
                        log::debug!("Slave {}: replied with the request bit set", address);
                    }
                    fdl::FunctionCode::Response { state, .. } => {
                        if state != fdl::ResponseState::Slave {
                            log::debug!(
                                "Slave {}: station is not a slave (detected type {:?})",
                                address,
                                state
                            );
                        } else {
                            self.set_state(bus, now, DpSlaveState::WaitDiag, None);
                            return Ok(None);
                        }
                    }
                }
            }
        }

        if self.request_idle_or_expired(now) {
            self.fault_deb.reset();
            self.fcb.set_enabled(false);

            let request = fdl::Telegram::Sd1(fdl::TelegramSd1 {
                da: address,
                sa: bus.address(),
                fc: fdl::FunctionCode::Request {
                    fcb: fdl::FrameCountBit::Inactive,
                    req: fdl::RequestType::FdlStatus,
                },
            });
            if !self.send_fdl(bus, now, request, TIMEOUT_FDL_STATUS) {
                log::debug!("Slave {}: FDL_Status request failed", address);
            }
        }
        Ok(None)
    }

    fn run_wait_diag<D: PhyDriver>(
        &mut self,
        bus: &mut MasterBus<D>,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, DpError> {
        let address = self.address();
        if self.just_entered() {
            log::debug!("Slave {}: requesting Slave_Diag...", address);
            self.rx_queue.clear();
        } else {
            for telegram in self.take_rx_queue() {
                match telegram {
                    DpTelegram::SlaveDiagCon(_) => {
                        self.set_state(bus, now, DpSlaveState::WaitPrm, None);
                        return Ok(None);
                    }
                    other => {
                        log::debug!("Slave {}: received spurious telegram: {:?}", address, other);
                    }
                }
            }
        }

        if self.request_idle_or_expired(now) {
            self.fcb.set_enabled(true);
            let request = DpTelegram::SlaveDiagReq(SlaveDiagRequest::new(address, bus.address()));
            if !self.send_dp(bus, now, request, TIMEOUT_INIT_REQUEST) {
                log::debug!("Slave {}: Slave_Diag request failed", address);
            }
        }
        Ok(None)
    }

    fn run_wait_prm<D: PhyDriver>(
        &mut self,
        bus: &mut MasterBus<D>,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, DpError> {
        let address = self.address();
        if self.just_entered() {
            log::debug!("Slave {}: sending Set_Prm...", address);
            self.rx_queue.clear();
        } else if self.short_ack_received {
            self.fcb.handle_reply();
            self.set_state(bus, now, DpSlaveState::WaitCfg, None);
            return Ok(None);
        }

        if self.request_idle_or_expired(now) {
            let request = DpTelegram::SetPrmReq(self.desc.set_prm_request(bus.address()));
            if !self.send_dp(bus, now, request, TIMEOUT_INIT_REQUEST) {
                log::debug!("Slave {}: Set_Prm request failed", address);
            }
        }
        Ok(None)
    }

    fn run_wait_cfg<D: PhyDriver>(
        &mut self,
        bus: &mut MasterBus<D>,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, DpError> {
        let address = self.address();
        if self.just_entered() {
            log::debug!("Slave {}: sending Chk_Cfg...", address);
            self.rx_queue.clear();
        } else if self.short_ack_received {
            self.fcb.handle_reply();
            self.set_state(bus, now, DpSlaveState::WaitDxReady, None);
            return Ok(None);
        }

        if self.request_idle_or_expired(now) {
            let request = DpTelegram::ChkCfgReq(self.desc.chk_cfg_request(bus.address()));
            if !self.send_dp(bus, now, request, TIMEOUT_INIT_REQUEST) {
                log::debug!("Slave {}: Chk_Cfg request failed", address);
            }
        }
        Ok(None)
    }

    fn run_wait_dx_ready<D: PhyDriver>(
        &mut self,
        bus: &mut MasterBus<D>,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, DpError> {
        let address = self.address();
        if self.just_entered() {
            log::debug!("Slave {}: requesting Slave_Diag (DX ready)...", address);
            self.rx_queue.clear();
        } else {
            for telegram in self.take_rx_queue() {
                match telegram {
                    DpTelegram::SlaveDiagCon(diag) => {
                        if diag.not_exist() {
                            log::error!("Slave {}: not reachable via this line", address);
                            self.fault_deb.fault();
                        }
                        if diag.cfg_fault() {
                            log::error!(
                                "Slave {}: reports a faulty configuration (Chk_Cfg)",
                                address
                            );
                            self.fault_deb.fault();
                        }
                        if diag.prm_fault() {
                            log::error!(
                                "Slave {}: reports a faulty parameterization (Set_Prm)",
                                address
                            );
                            self.fault_deb.fault();
                        }
                        if diag.prm_req() {
                            log::debug!(
                                "Slave {}: requests a new parameterization (Set_Prm)",
                                address
                            );
                            self.fault_deb.fault();
                        }
                        if diag.not_supported() {
                            log::error!(
                                "Slave {}: replied with \"function not supported\", \
                                 the parameters should be checked (Set_Prm)",
                                address
                            );
                            self.fault_deb.fault();
                        }
                        if diag.master_lock() {
                            log::error!(
                                "Slave {}: already controlled by (locked to) master {}",
                                address,
                                diag.master_address
                            );
                            self.fault_deb.fault();
                        }
                        if !diag.has_always_one_bit() {
                            log::debug!("Slave {}: diagnostic always-one bit is zero", address);
                            self.fault_deb.fault();
                        }
                        if diag.has_ext_diag() {
                            log::warn!(
                                "Slave {}: extended diagnosis available ({} bytes)",
                                address,
                                diag.ext_diag.len()
                            );
                            self.fault_deb.fault();
                        }

                        if diag.is_ready_data_ex() {
                            self.set_state(bus, now, DpSlaveState::DataExchange, None);
                            return Ok(None);
                        }
                        if diag.needs_new_prm_cfg() {
                            self.set_state(bus, now, DpSlaveState::Init, None);
                            return Ok(None);
                        }
                        break;
                    }
                    other => {
                        log::debug!("Slave {}: received spurious telegram: {:?}", address, other);
                        self.fault_deb.fault();
                    }
                }
            }
        }

        if self.request_idle_or_expired(now) {
            let request = DpTelegram::SlaveDiagReq(SlaveDiagRequest::new(address, bus.address()));
            if !self.send_dp(bus, now, request, TIMEOUT_INIT_REQUEST) {
                log::debug!("Slave {}: Slave_Diag request failed", address);
                self.fault_deb.fault();
            }
        }

        self.check_fault_deb(bus, now, false);
        Ok(None)
    }

    fn run_data_exchange<D: PhyDriver>(
        &mut self,
        bus: &mut MasterBus<D>,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, DpError> {
        let address = self.address();
        let mut data_in: Option<Vec<u8>> = None;

        if self.just_entered() {
            log::info!(
                "Slave {}: {}running Data_Exchange...",
                address,
                if self.dx_cycle_running {
                    ""
                } else {
                    "initialization finished, "
                }
            );
            self.rx_queue.clear();
            self.fault_deb.ok();
            self.dx_start = now;
            self.dx_cycle_running = true;
            self.dx_count = 0;
        }

        let output_size = self.desc.output_size;
        if self.pending_deadline.is_some() {
            for telegram in self.take_rx_queue() {
                if output_size == 0 {
                    // This slave is not supposed to send any data.
                    log::debug!(
                        "Slave {}: ignoring telegram in Data_Exchange: {:?}",
                        address,
                        telegram
                    );
                    self.fault_deb.fault();
                    continue;
                }
                let con = match telegram {
                    DpTelegram::DataExchangeCon(con) => con,
                    other => {
                        log::debug!(
                            "Slave {}: ignoring telegram in Data_Exchange: {:?}",
                            address,
                            other
                        );
                        self.fault_deb.fault();
                        continue;
                    }
                };
                if let Some(status) = con.fc.response_status() {
                    if status.requests_diagnostics() {
                        log::debug!("Slave {}: requested diagnostics", address);
                        self.set_state(
                            bus,
                            now,
                            DpSlaveState::WaitDxReady,
                            Some(TIME_LIMIT_DIAG_SHORT),
                        );
                    } else if status == fdl::ResponseStatus::SapNotEnabled {
                        log::error!("Slave {}: reports \"no service activated\"", address);
                        self.set_state(bus, now, DpSlaveState::Init, None);
                        return Err(DpError::ServiceNotActive { address });
                    }
                }
                data_in = Some(con.du);
            }

            if data_in.is_some() || (output_size == 0 && self.short_ack_received) {
                // We received data or, for a slave without input data, the
                // short confirmation.
                self.pending_deadline = None;
                self.fault_deb.ok();
                self.restart_state_timeout(now);
                bus.trans.fdl_mut().release_bus(now);
            } else if self.request_expired(now) {
                log::debug!("Slave {}: Data_Exchange timeout", address);
                self.fault_deb.fault();
                self.pending_deadline = None;
            }
        } else {
            let diag_period = self.desc.diag_period;
            if diag_period > 0 && self.dx_count >= diag_period {
                // Periodic diagnosis cycle.
                self.set_state(
                    bus,
                    now,
                    DpSlaveState::WaitDxReady,
                    Some(TIME_LIMIT_DIAG_SHORT),
                );
            } else if let Some(du) = self.to_slave_data.clone() {
                if self.desc.input_size == 0 {
                    log::warn!(
                        "Slave {}: got out-data, but the slave does not take any input data",
                        address
                    );
                    self.to_slave_data = None;
                } else {
                    let request = DpTelegram::DataExchangeReq(DataExchangeRequest::new(
                        address,
                        bus.address(),
                        du,
                    ));
                    if self.send_dp(bus, now, request, TIMEOUT_DATA_EXCHANGE) {
                        // Sent; consume the out-data slot.
                        self.to_slave_data = None;
                        self.dx_count = self.dx_count.saturating_add(1).min(0x3FFF_FFFF);
                    } else {
                        log::debug!("Slave {}: Data_Exchange request failed", address);
                        self.fault_deb.fault();
                    }
                }
            }
        }

        if self.check_fault_deb(bus, now, true) {
            return Ok(None);
        }
        Ok(data_in)
    }

    /// Evaluate the fault counter and escalate if necessary.
    ///
    /// Returns `true` when a state change was initiated.
    fn check_fault_deb<D: PhyDriver>(
        &mut self,
        bus: &mut MasterBus<D>,
        now: Instant,
        in_data_exchange: bool,
    ) -> bool {
        let faults = self.fault_deb.value();
        if faults >= 5 {
            log::warn!(
                "Slave {}: communication lost in Data_Exchange or Slave_Diag",
                self.address()
            );
            self.set_state(bus, now, DpSlaveState::Init, None);
            true
        } else if faults >= 3
            && in_data_exchange
            && (now >= self.dx_start + DX_SETTLE_TIME || self.desc.output_size == 0)
        {
            log::warn!(
                "Slave {}: many errors in Data_Exchange, requesting diagnostic information",
                self.address()
            );
            self.set_state(
                bus,
                now,
                DpSlaveState::WaitDxReady,
                Some(TIME_LIMIT_DIAG_SHORT),
            );
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_debouncer_thresholds() {
        let mut deb = FaultDebouncer::new();
        assert_eq!(deb.value(), 0);

        for _ in 0..5 {
            deb.fault();
        }
        assert!(deb.value() >= 5);

        for _ in 0..10 {
            deb.ok();
        }
        assert_eq!(deb.value(), 0);

        // One success halves a single fault away.
        deb.fault();
        assert_eq!(deb.value(), 1);
        deb.ok();
        deb.ok();
        assert_eq!(deb.value(), 0);
    }

    #[test]
    fn descriptor_templates() {
        let mut desc = SlaveDescriptor::new(8, 0x4224);
        desc.set_group_mask(0x03);
        desc.set_sync_mode(true);
        desc.set_watchdog(300).unwrap();
        desc.set_user_prm_data(vec![0x00, 0x42]);

        let prm = desc.set_prm_request(2);
        assert_eq!(prm.da, 8);
        assert_eq!(prm.sa, 2);
        assert_eq!(prm.ident_number, 0x4224);
        assert_eq!(prm.group_ident, 0x03);
        assert!(prm
            .station_status
            .contains(crate::dp::StationStatus::SYNC_REQ));
        assert!(prm
            .station_status
            .contains(crate::dp::StationStatus::WATCHDOG_ON));
        assert_eq!((prm.wd_fact_1, prm.wd_fact_2), (30, 1));
        assert_eq!(prm.user_prm_data, vec![0x00, 0x42]);
    }
}
