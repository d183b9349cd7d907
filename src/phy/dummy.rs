//! Loop-back dummy slave PHY.
//!
//! This driver does not touch any hardware.  It mocks a single well-behaved
//! DP slave: status requests are answered, parameterization and
//! configuration are acknowledged, and `Data_Exchange` echoes the out-data
//! with every byte inverted.  Useful for tests and for trying out the
//! master without a bus.

use std::collections::VecDeque;

use crate::dp::{DataExchangeConfirm, DiagStatus2, DpTelegram, SlaveDiagConfirm};
use crate::fdl;
use crate::phy::{PhyDriver, PhyError};

#[derive(Debug, Default)]
pub struct DummySlavePhy {
    poll_queue: VecDeque<Vec<u8>>,
    no_echo_dx: bool,
    echo_dx_size: Option<usize>,
    transmit_faults: u32,
}

impl DummySlavePhy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `Data_Exchange` with a short confirmation instead of echoed
    /// data.
    pub fn set_echo_dx(&mut self, echo: bool) {
        self.no_echo_dx = !echo;
    }

    /// Force the echoed DX data to this size (truncating or zero-padding).
    pub fn set_echo_dx_size(&mut self, size: Option<usize>) {
        self.echo_dx_size = size;
    }

    /// Make the next `count` transmissions fail.
    pub fn inject_transmit_faults(&mut self, count: u32) {
        self.transmit_faults = count;
    }

    fn push_reply(&mut self, telegram: fdl::Telegram) {
        let mut buffer = [0u8; 256];
        match telegram.serialize(&mut buffer) {
            Ok(length) => self.poll_queue.push_back(buffer[..length].to_vec()),
            Err(e) => log::debug!("Dummy slave: cannot encode reply: {}", e),
        }
    }

    fn mock_reply(&mut self, data: &[u8]) -> Result<(), PhyError> {
        let telegram = match fdl::Telegram::deserialize(data) {
            Some(Ok((telegram, _))) => telegram,
            _ => {
                return Err(PhyError::Transmit(
                    "dummy slave received a malformed frame".to_string(),
                ))
            }
        };

        // FDL status requests are answered below the DP layer.
        if let fdl::Telegram::Sd1(t) = &telegram {
            if matches!(
                t.fc,
                fdl::FunctionCode::Request {
                    req: fdl::RequestType::FdlStatus,
                    ..
                }
            ) {
                self.push_reply(fdl::Telegram::Sd1(fdl::TelegramSd1 {
                    da: t.sa,
                    sa: t.da,
                    fc: fdl::FunctionCode::Response {
                        state: fdl::ResponseState::Slave,
                        status: fdl::ResponseStatus::Ok,
                    },
                }));
                return Ok(());
            }
        }

        match DpTelegram::from_fdl(telegram, false) {
            Ok(DpTelegram::SlaveDiagReq(req)) => {
                let mut con = SlaveDiagConfirm::new(req.sa, req.da);
                con.status_2 |= DiagStatus2::ALWAYS_ONE;
                self.push_reply(DpTelegram::SlaveDiagCon(con).to_fdl());
            }
            Ok(DpTelegram::SetPrmReq(_)) | Ok(DpTelegram::ChkCfgReq(_)) => {
                self.push_reply(fdl::Telegram::Sc);
            }
            Ok(DpTelegram::DataExchangeReq(req)) => {
                if self.no_echo_dx {
                    self.push_reply(fdl::Telegram::Sc);
                } else {
                    let mut du: Vec<u8> = req.du.iter().map(|b| b ^ 0xFF).collect();
                    if let Some(size) = self.echo_dx_size {
                        du.resize(size, 0x00);
                    }
                    let con = DataExchangeConfirm::new(req.sa, req.da, du);
                    self.push_reply(DpTelegram::DataExchangeCon(con).to_fdl());
                }
            }
            Ok(other) => {
                log::debug!("Dummy slave: dropping SRD telegram: {:?}", other);
            }
            Err(e) => {
                log::debug!("Dummy slave: cannot dispatch telegram: {}", e);
            }
        }
        Ok(())
    }
}

impl PhyDriver for DummySlavePhy {
    fn transmit(&mut self, data: &[u8], srd: bool) -> Result<(), PhyError> {
        if self.transmit_faults > 0 {
            self.transmit_faults -= 1;
            return Err(PhyError::Transmit("injected transmit fault".to_string()));
        }
        log::trace!(
            "Dummy slave: {} {:02X?}",
            if srd { "SRD" } else { "SDN" },
            data
        );
        if !srd {
            return Ok(());
        }
        self.mock_reply(data)
    }

    fn receive(&mut self, _timeout: crate::time::Duration) -> Result<Option<Vec<u8>>, PhyError> {
        Ok(self.poll_queue.pop_front())
    }

    fn apply_baudrate(&mut self, _baudrate: crate::Baudrate) -> Result<(), PhyError> {
        self.poll_queue.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.poll_queue.clear();
    }
}
