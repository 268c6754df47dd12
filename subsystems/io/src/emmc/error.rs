//! SD driver and block-device errors

use super::commands::Command;
use super::registers::Interrupt;
use core::fmt;

/// SD driver errors, one per failure point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    /// Firmware did not power the slot
    PowerOn,
    /// Host controller did not leave reset
    ControllerResetTimeout,
    /// No card in the slot
    NoCard,
    /// Internal clock did not stabilise
    ClockStableTimeout,
    /// CMD or DAT line did not leave reset
    LineResetTimeout,
    /// CMD or DAT lines stayed busy before a clock change
    InhibitTimeout,
    /// GO_IDLE_STATE failed
    GoIdle,
    /// SEND_IF_COND failed with something other than a timeout
    InterfaceCondition,
    /// SEND_IF_COND echoed the wrong check pattern
    VoltageCheck(u32),
    /// Card answered IO_SET_OP_COND
    SdioCard,
    /// Inquiry SD_SEND_OP_COND failed
    OpCondInquiry,
    /// SD_SEND_OP_COND failed
    OpCond,
    /// Card stayed busy through every SD_SEND_OP_COND poll
    OpCondTimeout,
    /// 1.8V switch failed even after the 3.3V fallback
    VoltageSwitch,
    /// ALL_SEND_CID failed
    Identify,
    /// SEND_RELATIVE_ADDR failed
    RelativeAddress,
    /// SEND_RELATIVE_ADDR reported an error or not ready
    AddressResponse {
        /// Raw R6 response
        status: u32,
    },
    /// SELECT_CARD failed
    Select,
    /// Card not in stand-by or transfer state after SELECT_CARD
    SelectState(u32),
    /// SET_BLOCKLEN failed
    BlockLength,
    /// SEND_SCR failed
    ReadScr,
    /// SEND_STATUS failed
    SendStatus,
    /// STOP_TRANSMISSION failed
    StopTransmission,
    /// Card did not reach the transfer state
    NotInTransferState(u32),
    /// Index is reserved in the command table
    ReservedCommand(Command),
    /// More than 65535 blocks in one command
    TooManyBlocks,
    /// Transfer of zero blocks
    EmptyTransfer,
    /// Buffer is not word aligned
    MisalignedBuffer,
    /// Buffer smaller than the requested blocks
    BufferTooSmall,
    /// Byte address does not fit the argument register
    AddressOutOfRange,
    /// Card removal was seen
    CardRemoved,
    /// No interrupt status bit arrived in time
    Timeout(Command),
    /// Controller flagged an error
    Command {
        /// Failed command
        command: Command,
        /// Error half of the interrupt status
        error: Interrupt,
    },
    /// Every data command attempt failed
    RetriesExhausted,
}

impl SdError {
    /// Negative status code for the legacy integer interface
    pub const fn code(&self) -> i32 {
        match self {
            SdError::PowerOn => -1,
            SdError::ControllerResetTimeout => -2,
            SdError::NoCard => -3,
            SdError::ClockStableTimeout => -4,
            SdError::LineResetTimeout => -5,
            SdError::GoIdle => -6,
            SdError::InterfaceCondition => -7,
            SdError::VoltageCheck(_) => -8,
            SdError::SdioCard => -9,
            SdError::OpCondInquiry => -10,
            SdError::OpCond => -11,
            SdError::OpCondTimeout => -12,
            SdError::VoltageSwitch => -13,
            SdError::Identify => -14,
            SdError::RelativeAddress => -15,
            SdError::AddressResponse { .. } => -16,
            SdError::Select => -17,
            SdError::SelectState(_) => -18,
            SdError::BlockLength => -19,
            SdError::ReadScr => -20,
            SdError::SendStatus => -21,
            SdError::StopTransmission => -22,
            SdError::NotInTransferState(_) => -23,
            SdError::ReservedCommand(_) => -24,
            SdError::TooManyBlocks => -25,
            SdError::EmptyTransfer => -26,
            SdError::MisalignedBuffer => -27,
            SdError::BufferTooSmall => -28,
            SdError::AddressOutOfRange => -29,
            SdError::CardRemoved => -30,
            SdError::Timeout(_) => -31,
            SdError::Command { .. } => -32,
            SdError::RetriesExhausted => -33,
            SdError::InhibitTimeout => -34,
        }
    }
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdError::PowerOn => write!(f, "slot did not power on"),
            SdError::ControllerResetTimeout => write!(f, "controller did not reset"),
            SdError::NoCard => write!(f, "no card inserted"),
            SdError::ClockStableTimeout => write!(f, "clock did not stabilise"),
            SdError::LineResetTimeout => write!(f, "CMD/DAT line did not reset"),
            SdError::InhibitTimeout => write!(f, "CMD/DAT lines stayed busy"),
            SdError::GoIdle => write!(f, "no GO_IDLE_STATE response"),
            SdError::InterfaceCondition => write!(f, "SEND_IF_COND failed"),
            SdError::VoltageCheck(resp) => write!(f, "unusable card (SEND_IF_COND {:#x})", resp),
            SdError::SdioCard => write!(f, "SDIO card not supported"),
            SdError::OpCondInquiry => write!(f, "inquiry ACMD41 failed"),
            SdError::OpCond => write!(f, "ACMD41 failed"),
            SdError::OpCondTimeout => write!(f, "card stayed busy"),
            SdError::VoltageSwitch => write!(f, "1.8V switch failed"),
            SdError::Identify => write!(f, "ALL_SEND_CID failed"),
            SdError::RelativeAddress => write!(f, "SEND_RELATIVE_ADDR failed"),
            SdError::AddressResponse { status } => write!(f, "bad SEND_RELATIVE_ADDR response {:#x}", status),
            SdError::Select => write!(f, "SELECT_CARD failed"),
            SdError::SelectState(state) => write!(f, "invalid state {} after SELECT_CARD", state),
            SdError::BlockLength => write!(f, "SET_BLOCKLEN failed"),
            SdError::ReadScr => write!(f, "SEND_SCR failed"),
            SdError::SendStatus => write!(f, "SEND_STATUS failed"),
            SdError::StopTransmission => write!(f, "STOP_TRANSMISSION failed"),
            SdError::NotInTransferState(state) => write!(f, "card stuck in state {}", state),
            SdError::ReservedCommand(cmd) => write!(f, "invalid command {}", cmd),
            SdError::TooManyBlocks => write!(f, "block count too large"),
            SdError::EmptyTransfer => write!(f, "zero block transfer"),
            SdError::MisalignedBuffer => write!(f, "buffer not word aligned"),
            SdError::BufferTooSmall => write!(f, "buffer too small"),
            SdError::AddressOutOfRange => write!(f, "block address out of range"),
            SdError::CardRemoved => write!(f, "card removed"),
            SdError::Timeout(cmd) => write!(f, "{} timed out", cmd),
            SdError::Command { command, error } => write!(f, "{} failed ({:#010x})", command, error.bits()),
            SdError::RetriesExhausted => write!(f, "data command failed after retries"),
        }
    }
}

/// Block-device status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum BiosError {
    /// Generic error
    Err = -1,
    /// Write fault
    WriteFault = -10,
    /// Read fault
    ReadFault = -11,
    /// Write protected
    WriteProtected = -13,
    /// Media changed
    MediaChanged = -14,
    /// Unknown device
    UnknownDevice = -15,
}

/// Success status code
pub const E_OK: i32 = 0;

impl BiosError {
    /// Integer status code
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for BiosError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BiosError::Err => "error",
            BiosError::WriteFault => "write fault",
            BiosError::ReadFault => "read fault",
            BiosError::WriteProtected => "write protected",
            BiosError::MediaChanged => "media changed",
            BiosError::UnknownDevice => "unknown device",
        };
        f.write_str(text)
    }
}
