use crate::dp::{DpError, DpTelegram};
use crate::fdl;
use crate::phy::PhyDriver;

/// Outcome of polling the bus at the DP layer.
#[derive(Debug)]
pub enum Reception {
    /// Token telegram (SD4).  Accepted and ignored by this master.
    Token { da: u8, sa: u8 },
    /// Short confirmation (SC).
    ShortConfirmation,
    /// A DP service telegram that passed the RX address filter.
    Telegram(DpTelegram),
    /// A telegram addressed to a foreign station.
    Foreign(fdl::Telegram),
    /// A data telegram that the DP layer could not dispatch.
    Undispatchable { sa: u8, error: DpError },
}

/// DP-layer transceiver on top of the FDL transceiver.
#[derive(Debug)]
pub struct DpTransceiver<D> {
    fdl: fdl::FdlTransceiver<D>,
    this_is_master: bool,
}

impl<D: PhyDriver> DpTransceiver<D> {
    pub fn new(fdl: fdl::FdlTransceiver<D>, this_is_master: bool) -> Self {
        Self {
            fdl,
            this_is_master,
        }
    }

    /// Poll for one telegram and dispatch its DP content.
    pub fn poll(
        &mut self,
        now: crate::time::Instant,
        timeout: crate::time::Duration,
    ) -> Result<Option<Reception>, fdl::PollError> {
        let Some(rx) = self.fdl.poll(now, timeout)? else {
            return Ok(None);
        };

        let telegram = match rx {
            fdl::RxTelegram::Foreign(t) => return Ok(Some(Reception::Foreign(t))),
            fdl::RxTelegram::Accepted(t) => t,
        };

        Ok(Some(match telegram {
            fdl::Telegram::Sd4(t) => Reception::Token { da: t.da, sa: t.sa },
            fdl::Telegram::Sc => Reception::ShortConfirmation,
            telegram => {
                let sa = telegram.source_address().unwrap_or(0);
                match DpTelegram::from_fdl(telegram, self.this_is_master) {
                    Ok(dp) => Reception::Telegram(dp),
                    Err(error) => Reception::Undispatchable { sa, error },
                }
            }
        }))
    }

    /// Send a DP service telegram through the FDL transmission discipline.
    pub fn send(
        &mut self,
        now: crate::time::Instant,
        fcb: &mut fdl::FcbContext,
        telegram: &DpTelegram,
    ) -> Result<(), fdl::SendError> {
        self.fdl.send(now, fcb, telegram.to_fdl())
    }

    /// Send a raw FDL telegram (used for `FDL_Status` requests).
    pub fn send_fdl(
        &mut self,
        now: crate::time::Instant,
        fcb: &mut fdl::FcbContext,
        telegram: fdl::Telegram,
    ) -> Result<(), fdl::SendError> {
        self.fdl.send(now, fcb, telegram)
    }

    #[inline(always)]
    pub fn fdl_mut(&mut self) -> &mut fdl::FdlTransceiver<D> {
        &mut self.fdl
    }
}
