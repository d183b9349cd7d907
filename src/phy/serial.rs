//! Serial port PHY driver.
//!
//! Talks to an RS-485 transceiver through a plain serial port with the
//! PROFIBUS UART framing (8 data bits, even parity, 1 stop bit).  Note that
//! common serial hardware only supports the slow baudrates; some devices
//! silently fall back to 9600 baud for unsupported rates.

use std::borrow::Cow;
use std::io::{Read, Write};

use crate::fdl;
use crate::phy::{PhyDriver, PhyError};

/// Time window during which all line data is discarded after a framing
/// error.
const DISCARD_WINDOW: std::time::Duration = std::time::Duration::from_millis(10);

pub struct SerialPortPhy {
    port: Box<dyn serialport::SerialPort>,
    rx_buffer: Vec<u8>,
    discard_until: Option<std::time::Instant>,
}

impl SerialPortPhy {
    pub fn new<'a, P: Into<Cow<'a, str>>>(
        serial_port: P,
        baudrate: crate::Baudrate,
    ) -> Result<Self, PhyError> {
        Self::new_inner(serial_port.into(), baudrate)
    }

    fn new_inner(serial_port: Cow<'_, str>, baudrate: crate::Baudrate) -> Result<Self, PhyError> {
        let rate = u32::try_from(baudrate.to_rate())
            .map_err(|_| PhyError::Config("baudrate out of range".to_string()))?;
        let port = serialport::new(serial_port.as_ref(), rate)
            .data_bits(serialport::DataBits::Eight)
            .flow_control(serialport::FlowControl::None)
            .parity(serialport::Parity::Even)
            .stop_bits(serialport::StopBits::One)
            .timeout(std::time::Duration::from_millis(1))
            .open()
            .map_err(|e| PhyError::Config(format!("failed to open serial port: {e}")))?;

        Ok(Self {
            port,
            rx_buffer: Vec::new(),
            discard_until: None,
        })
    }

    fn start_discard(&mut self) {
        self.discard_until = Some(std::time::Instant::now() + DISCARD_WINDOW);
        self.rx_buffer.clear();
    }

    /// Handle an active discard window.  Returns `true` while discarding.
    fn discard(&mut self) -> Result<bool, PhyError> {
        let Some(until) = self.discard_until else {
            return Ok(false);
        };
        let _ = self.port.clear(serialport::ClearBuffer::All);
        if std::time::Instant::now() >= until {
            self.discard_until = None;
            return Ok(false);
        }
        Ok(true)
    }

    fn read_available(&mut self, want: usize) -> Result<(), PhyError> {
        let available = self
            .port
            .bytes_to_read()
            .map_err(|e| PhyError::Receive(e.to_string()))?;
        let available = usize::try_from(available).unwrap_or(usize::MAX);
        let count = want.min(available);
        if count == 0 {
            return Ok(());
        }

        let offset = self.rx_buffer.len();
        self.rx_buffer.resize(offset + count, 0);
        let mut cursor = offset;
        while cursor < offset + count {
            match self.port.read(&mut self.rx_buffer[cursor..offset + count]) {
                Ok(0) => break,
                Ok(n) => cursor += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => {
                    self.rx_buffer.truncate(offset);
                    self.start_discard();
                    return Err(PhyError::Receive(e.to_string()));
                }
            }
        }
        self.rx_buffer.truncate(cursor);
        Ok(())
    }
}

impl PhyDriver for SerialPortPhy {
    fn transmit(&mut self, data: &[u8], _srd: bool) -> Result<(), PhyError> {
        if self.discard_until.is_some() {
            // Do not transmit into a line that is being flushed.
            return Ok(());
        }
        log::trace!("Serial TX {:02X?}", data);
        self.port
            .write_all(data)
            .map_err(|e| PhyError::Transmit(e.to_string()))
    }

    fn receive(&mut self, timeout: crate::time::Duration) -> Result<Option<Vec<u8>>, PhyError> {
        let deadline = std::time::Instant::now() + core::time::Duration::from(timeout);

        loop {
            if self.discard()? {
                if std::time::Instant::now() >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(std::time::Duration::from_micros(100));
                continue;
            }

            // Figure out how many bytes the frame at the buffer front
            // still needs, using the codec's framing rules.
            let want = match fdl::Telegram::size_from_raw(&self.rx_buffer) {
                None => {
                    // Size not determinable yet; fetch the smallest amount
                    // that could complete the decision.
                    4usize.saturating_sub(self.rx_buffer.len()).max(1)
                }
                Some(Ok(size)) => {
                    if self.rx_buffer.len() >= size {
                        let frame: Vec<u8> = self.rx_buffer.drain(..size).collect();
                        log::trace!("Serial RX {:02X?}", frame);
                        return Ok(Some(frame));
                    }
                    size - self.rx_buffer.len()
                }
                Some(Err(e)) => {
                    log::debug!(
                        "Serial RX fragment discarded: {:02X?} ({})",
                        self.rx_buffer,
                        e
                    );
                    self.start_discard();
                    return Err(PhyError::Receive(format!(
                        "failed to get received telegram size: {e}"
                    )));
                }
            };

            self.read_available(want)?;

            if std::time::Instant::now() >= deadline {
                // One last check whether the frame completed.
                if let Some(Ok(size)) = fdl::Telegram::size_from_raw(&self.rx_buffer) {
                    if self.rx_buffer.len() >= size {
                        continue;
                    }
                }
                return Ok(None);
            }
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
    }

    fn apply_baudrate(&mut self, baudrate: crate::Baudrate) -> Result<(), PhyError> {
        let rate = u32::try_from(baudrate.to_rate())
            .map_err(|_| PhyError::Config("baudrate out of range".to_string()))?;
        if !matches!(baudrate, crate::Baudrate::B9600 | crate::Baudrate::B19200) {
            log::warn!(
                "Baudrate {} bit/s might not be supported by the serial hardware; \
                 commonly well supported are 9600 and 19200",
                rate
            );
        }
        self.port
            .set_baud_rate(rate)
            .map_err(|e| PhyError::Config(e.to_string()))?;
        self.rx_buffer.clear();
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.port.clear(serialport::ClearBuffer::All);
        self.rx_buffer.clear();
    }
}
