//! PHY - Physical layer access
//!
//! The engine talks to the bus through the narrow [`PhyDriver`] contract.
//! [`Phy`] wraps a driver with the outbound per-address queue and the
//! bus-allocation throttle which accounts for the symbol time of every
//! transmitted octet and its expected reply.

#[cfg(feature = "phy-dummy")]
mod dummy;
#[cfg(feature = "phy-dummy")]
pub use dummy::DummySlavePhy;

#[cfg(feature = "phy-serial")]
mod serial;
#[cfg(feature = "phy-serial")]
pub use serial::SerialPortPhy;

use std::collections::VecDeque;

/// Upper bound for the encoded size of any telegram.
pub const MAX_TELEGRAM_LEN: usize = 255;

/// Errors reported by PHY drivers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhyError {
    /// The PHY device was closed.  Not recoverable.
    #[error("PHY device is closed")]
    Closed,
    #[error("PHY transmit failed: {0}")]
    Transmit(String),
    #[error("PHY receive failed: {0}")]
    Receive(String),
    #[error("PHY configuration failed: {0}")]
    Config(String),
}

impl PhyError {
    /// Whether this error ends the PHY session for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PhyError::Closed)
    }
}

/// Byte-accurate access to the physical line.
///
/// Implementations must not buffer partial frames towards the caller:
/// [`receive`][`PhyDriver::receive`] reassembles and returns one complete
/// FDL frame at a time, using the same framing rules as the telegram codec
/// ([`Telegram::size_from_raw`][`crate::fdl::Telegram::size_from_raw`]).
pub trait PhyDriver {
    /// Transmit one raw frame.
    ///
    /// `srd` tells the driver that a reply is expected; it may use this to
    /// switch the RS-485 direction or arm a receive window.
    fn transmit(&mut self, data: &[u8], srd: bool) -> Result<(), PhyError>;

    /// Return the next completed frame, waiting up to `timeout`.
    fn receive(&mut self, timeout: crate::time::Duration) -> Result<Option<Vec<u8>>, PhyError>;

    /// Change the line rate.  Invalidates any buffered bytes.
    fn apply_baudrate(&mut self, baudrate: crate::Baudrate) -> Result<(), PhyError>;

    /// Release the line.  Subsequent operations may fail.
    fn close(&mut self);
}

#[derive(Debug)]
struct QueuedFrame {
    data: Vec<u8>,
    srd: bool,
}

/// A PHY driver combined with the outbound queue and bus timing.
///
/// At most one frame is queued per destination address; queueing another
/// frame for the same address replaces the old one.  A frame is only handed
/// to the driver once the bus-allocation window of the previous transmission
/// (send octets plus the reply window, 11 symbol times each) has passed.
#[derive(Debug)]
pub struct Phy<D> {
    driver: D,
    queue_order: VecDeque<u8>,
    queue_slots: Vec<Option<QueuedFrame>>,
    alloc_until: crate::time::Instant,
    octet_time: crate::time::Duration,
    closed: bool,
}

impl<D: PhyDriver> Phy<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            queue_order: VecDeque::new(),
            queue_slots: (0..=usize::from(crate::consts::ADDRESS_MASK))
                .map(|_| None)
                .collect(),
            alloc_until: crate::time::Instant::ZERO,
            octet_time: crate::time::Duration::ZERO,
            closed: false,
        }
    }

    /// Set the line rate.  Re-arms the bus-allocation timing.
    pub fn set_config(&mut self, baudrate: crate::Baudrate) -> Result<(), PhyError> {
        if self.closed {
            return Err(PhyError::Closed);
        }
        self.octet_time = baudrate.octets_to_time(1);
        self.driver.apply_baudrate(baudrate)
    }

    /// Queue a frame for the given destination and transmit as soon as the
    /// bus allows.
    pub fn send(
        &mut self,
        now: crate::time::Instant,
        da: u8,
        frame: &[u8],
        srd: bool,
    ) -> Result<(), PhyError> {
        if self.closed {
            return Err(PhyError::Closed);
        }
        let da = da & crate::consts::ADDRESS_MASK;
        let slot = &mut self.queue_slots[usize::from(da)];
        if slot.is_none() {
            self.queue_order.push_back(da);
        }
        *slot = Some(QueuedFrame {
            data: frame.to_vec(),
            srd,
        });
        self.pump(now)
    }

    /// Pump the queue, then poll the driver for one received frame.
    pub fn poll(
        &mut self,
        now: crate::time::Instant,
        timeout: crate::time::Duration,
    ) -> Result<Option<Vec<u8>>, PhyError> {
        if self.closed {
            return Err(PhyError::Closed);
        }
        self.pump(now)?;
        self.driver.receive(timeout)
    }

    fn pump(&mut self, now: crate::time::Instant) -> Result<(), PhyError> {
        if now < self.alloc_until {
            return Ok(());
        }
        let Some(da) = self.queue_order.pop_front() else {
            return Ok(());
        };
        let frame = self.queue_slots[usize::from(da)]
            .take()
            .expect("TX queue out of sync");

        let reply_octets = if frame.srd { MAX_TELEGRAM_LEN } else { 0 };
        let occupied = u32::try_from(frame.data.len() + reply_octets).unwrap_or(u32::MAX);
        self.alloc_until = now + self.octet_time * occupied;

        self.driver.transmit(&frame.data, frame.srd)
    }

    /// Immediately relinquish the bus-allocation window.
    pub fn release_bus(&mut self, now: crate::time::Instant) {
        self.alloc_until = now;
        if !self.closed {
            if let Err(e) = self.pump(now) {
                log::debug!("TX error while releasing the bus: {}", e);
            }
        }
    }

    /// Drop any queued frame for the given destination address.
    pub fn clear_tx_queue(&mut self, da: u8) {
        let da = da & crate::consts::ADDRESS_MASK;
        if self.queue_slots[usize::from(da)].take().is_some() {
            self.queue_order.retain(|&queued| queued != da);
        }
    }

    /// Close the PHY.  All subsequent send/poll operations fail with
    /// [`PhyError::Closed`].
    pub fn close(&mut self) {
        if !self.closed {
            self.driver.close();
            self.closed = true;
            self.queue_order.clear();
            self.queue_slots.iter_mut().for_each(|s| *s = None);
        }
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline(always)]
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingDriver {
        sent: Vec<(Vec<u8>, bool)>,
    }

    impl PhyDriver for RecordingDriver {
        fn transmit(&mut self, data: &[u8], srd: bool) -> Result<(), PhyError> {
            self.sent.push((data.to_vec(), srd));
            Ok(())
        }

        fn receive(
            &mut self,
            _timeout: crate::time::Duration,
        ) -> Result<Option<Vec<u8>>, PhyError> {
            Ok(None)
        }

        fn apply_baudrate(&mut self, _baudrate: crate::Baudrate) -> Result<(), PhyError> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    #[test]
    fn bus_allocation_throttle() {
        let mut phy = Phy::new(RecordingDriver::default());
        phy.set_config(crate::Baudrate::B500000).unwrap();

        let t0 = crate::time::Instant::ZERO;
        phy.send(t0, 8, &[0x10, 0x08, 0x02, 0x49, 0x53, 0x16], true)
            .unwrap();
        assert_eq!(phy.driver_mut().sent.len(), 1);

        // The second frame stays queued until the allocation window of the
        // first one (6 + 255 octets) has passed.
        phy.send(t0, 9, &[0xE5], false).unwrap();
        assert_eq!(phy.driver_mut().sent.len(), 1);

        let window = crate::Baudrate::B500000.octets_to_time(6 + 255);
        phy.poll(t0 + window, crate::time::Duration::ZERO).unwrap();
        assert_eq!(phy.driver_mut().sent.len(), 2);
    }

    #[test]
    fn queue_replaces_per_destination() {
        let mut phy = Phy::new(RecordingDriver::default());
        phy.set_config(crate::Baudrate::B500000).unwrap();

        let t0 = crate::time::Instant::ZERO;
        phy.send(t0, 8, &[0x01], true).unwrap();
        // Window is busy now; these two stay in the queue with the second
        // one replacing the first.
        phy.send(t0, 9, &[0x02], false).unwrap();
        phy.send(t0, 9, &[0x03], false).unwrap();

        phy.release_bus(t0);
        let sent: Vec<_> = phy.driver_mut().sent.drain(..).collect();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0, vec![0x03]);
    }

    #[test]
    fn clear_tx_queue_drops_pending() {
        let mut phy = Phy::new(RecordingDriver::default());
        phy.set_config(crate::Baudrate::B500000).unwrap();

        let t0 = crate::time::Instant::ZERO;
        phy.send(t0, 8, &[0x01], true).unwrap();
        phy.send(t0, 9, &[0x02], false).unwrap();
        phy.clear_tx_queue(9);
        phy.release_bus(t0);
        assert_eq!(phy.driver_mut().sent.len(), 1);
    }

    #[test]
    fn closed_phy_errors() {
        let mut phy = Phy::new(RecordingDriver::default());
        phy.close();
        assert_eq!(
            phy.send(crate::time::Instant::ZERO, 8, &[0x01], false),
            Err(PhyError::Closed)
        );
        assert!(matches!(
            phy.poll(crate::time::Instant::ZERO, crate::time::Duration::ZERO),
            Err(PhyError::Closed)
        ));
    }
}
