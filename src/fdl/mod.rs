//! FDL - Fieldbus Data Link (PROFIBUS layer 2)
//!
//! This module implements the telegram codec and the transceiver with the
//! per-slave frame count bit (FCB) transmission discipline.
mod telegram;
mod transceiver;

pub use telegram::{
    FdlError, FrameCountBit, FunctionCode, RequestType, ResponseState, ResponseStatus, Telegram,
    TelegramSd1, TelegramSd2, TelegramSd3, TelegramSd4,
};
pub use transceiver::{FcbContext, FdlTransceiver, PollError, RxTelegram, SendError};
