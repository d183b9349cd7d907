use crate::fdl::{FdlError, FrameCountBit, FunctionCode, Telegram};
use crate::phy::{Phy, PhyDriver, PhyError};

/// Per-peer frame count bit context.
///
/// The FCB (Frame Count Bit) is used to detect lost messages and prevent
/// duplication on either side.  The master keeps one context per slave and
/// advances it whenever a reply (or short confirmation) for an
/// acknowledged/SRD request arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FcbContext {
    bit: bool,
    valid: bool,
    waiting_reply: bool,
    enabled: bool,
}

impl Default for FcbContext {
    fn default() -> Self {
        Self::new()
    }
}

impl FcbContext {
    pub fn new() -> Self {
        Self {
            bit: true,
            valid: false,
            waiting_reply: false,
            enabled: false,
        }
    }

    /// Back to the first-cycle state (FCB=1, FCV=0).
    pub fn reset(&mut self) {
        self.bit = true;
        self.valid = false;
        self.waiting_reply = false;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[inline(always)]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Advance to the next message cycle.
    pub fn cycle(&mut self) {
        self.bit = !self.bit;
        self.valid = true;
        self.waiting_reply = false;
    }

    /// Mark that the last request is still awaiting its reply.
    pub fn set_waiting_reply(&mut self) {
        self.waiting_reply = true;
    }

    /// A reply for the outstanding request arrived; cycle the bit.
    pub fn handle_reply(&mut self) {
        if self.waiting_reply {
            self.cycle();
        }
    }

    /// Wire image of this context for the next transmitted request.
    pub fn frame_count_bit(&self) -> FrameCountBit {
        if self.enabled {
            FrameCountBit::from_fcv_fcb(self.valid, self.bit)
        } else {
            FrameCountBit::Inactive
        }
    }
}

/// A telegram received from the bus, tagged with the RX filter decision.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RxTelegram {
    /// The telegram is addressed to us (or carries no destination at all).
    Accepted(Telegram),
    /// The telegram is addressed to a foreign station.
    Foreign(Telegram),
}

/// Errors surfaced by [`FdlTransceiver::poll`].
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Phy(#[from] PhyError),
    #[error("received corrupt telegram: {0}")]
    Decode(#[from] FdlError),
}

/// Errors surfaced by [`FdlTransceiver::send`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Phy(#[from] PhyError),
    #[error("cannot encode telegram: {0}")]
    Encode(#[from] FdlError),
}

/// Frame-oriented send/receive on top of a PHY.
///
/// Outgoing request telegrams get the FCB/FCV bits of the supplied
/// [`FcbContext`] stamped into their function code right before
/// transmission.
type RxFilter = bitvec::BitArr!(for 128);

#[derive(Debug)]
pub struct FdlTransceiver<D> {
    phy: Phy<D>,
    rx_filter: Option<RxFilter>,
}

impl<D: PhyDriver> FdlTransceiver<D> {
    pub fn new(phy: Phy<D>) -> Self {
        Self {
            phy,
            rx_filter: None,
        }
    }

    /// Restrict reception to the given destination addresses.
    ///
    /// `None` accepts all addresses.  Telegrams without a destination
    /// address field (e.g. the short confirmation) always pass the filter.
    pub fn set_rx_filter(&mut self, addresses: Option<&[u8]>) {
        self.rx_filter = addresses.map(|addresses| {
            let mut filter = bitvec::array::BitArray::ZERO;
            for addr in addresses {
                filter.set(usize::from(addr & crate::consts::ADDRESS_MASK), true);
            }
            filter
        });
    }

    fn check_rx_filter(&self, telegram: &Telegram) -> bool {
        match (telegram.destination_address(), self.rx_filter.as_ref()) {
            (Some(da), Some(filter)) => filter[usize::from(da & crate::consts::ADDRESS_MASK)],
            _ => true,
        }
    }

    /// Poll the PHY for one complete telegram.
    pub fn poll(
        &mut self,
        now: crate::time::Instant,
        timeout: crate::time::Duration,
    ) -> Result<Option<RxTelegram>, PollError> {
        let Some(raw) = self.phy.poll(now, timeout)? else {
            return Ok(None);
        };
        match Telegram::deserialize(&raw) {
            None => Err(FdlError::TruncatedFrame.into()),
            Some(Err(e)) => Err(e.into()),
            Some(Ok((telegram, _size))) => {
                log::trace!("FDL RX {:?}", telegram);
                if self.check_rx_filter(&telegram) {
                    Ok(Some(RxTelegram::Accepted(telegram)))
                } else {
                    Ok(Some(RxTelegram::Foreign(telegram)))
                }
            }
        }
    }

    /// Send a telegram, applying the FCB transmission discipline.
    pub fn send(
        &mut self,
        now: crate::time::Instant,
        fcb: &mut FcbContext,
        mut telegram: Telegram,
    ) -> Result<(), SendError> {
        let mut srd = false;
        if let Some(FunctionCode::Request { fcb: wire, req }) = telegram.function_code_mut() {
            srd = req.expects_reply();
            *wire = fcb.frame_count_bit();
            if fcb.enabled() {
                if srd {
                    fcb.set_waiting_reply();
                } else {
                    fcb.cycle();
                }
            }
        }

        let Some(da) = telegram.destination_address() else {
            return Err(PhyError::Transmit(
                "attempted to send a telegram without destination address".to_string(),
            )
            .into());
        };

        let mut buffer = [0u8; 256];
        let length = telegram.serialize(&mut buffer)?;
        log::trace!("FDL TX {:?}", telegram);
        self.phy.send(now, da, &buffer[..length], srd)?;
        Ok(())
    }

    #[inline(always)]
    pub fn release_bus(&mut self, now: crate::time::Instant) {
        self.phy.release_bus(now);
    }

    #[inline(always)]
    pub fn clear_tx_queue(&mut self, da: u8) {
        self.phy.clear_tx_queue(da);
    }

    pub fn set_config(&mut self, baudrate: crate::Baudrate) -> Result<(), PhyError> {
        self.phy.set_config(baudrate)
    }

    pub fn close(&mut self) {
        self.phy.close();
    }

    #[inline(always)]
    pub fn phy_mut(&mut self) -> &mut Phy<D> {
        &mut self.phy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fcb_discipline() {
        let mut fcb = FcbContext::new();
        assert_eq!(fcb.frame_count_bit(), FrameCountBit::Inactive);

        fcb.set_enabled(true);
        assert_eq!(fcb.frame_count_bit(), FrameCountBit::First);

        // SRD request goes out, reply arrives.
        fcb.set_waiting_reply();
        fcb.handle_reply();
        assert_eq!(fcb.frame_count_bit(), FrameCountBit::Low);

        fcb.set_waiting_reply();
        fcb.handle_reply();
        assert_eq!(fcb.frame_count_bit(), FrameCountBit::High);

        // A reply without an outstanding request does not cycle.
        fcb.handle_reply();
        assert_eq!(fcb.frame_count_bit(), FrameCountBit::High);

        fcb.reset();
        assert_eq!(fcb.frame_count_bit(), FrameCountBit::First);

        fcb.set_enabled(false);
        assert_eq!(fcb.frame_count_bit(), FrameCountBit::Inactive);
    }
}
