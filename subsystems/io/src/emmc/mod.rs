//! # EMMC / SD Card Driver
//!
//! Polled driver for the Arasan SDHCI controller of the BCM283x.
//!
//! ```text
//!   read_write / ioctl
//!          |
//!   ensure_data_mode ---- card_reset (power, clocks, enumeration)
//!          |
//!   do_data_command (3 attempts)
//!          |
//!   issue_command ------- APP_CMD wrapper, removal check
//!          |
//!   low-level issue ----- BLKSIZECNT/ARG1/CMDTM, INTERRUPT polling, FIFO
//! ```
//!
//! Every wait is a busy poll of the INTERRUPT or STATUS register bounded by
//! a microsecond timeout. Interrupt status bits are write-1-to-clear and
//! are cleared explicitly after each wait.

pub mod card;
pub mod clock;
pub mod commands;
pub mod error;
pub mod registers;

#[cfg(test)]
pub(crate) mod sim;

pub use card::{CardInfo, CardState, CardStatus, RcaResponse, Scr, SdVersion};
pub use commands::{Command, CommandWord, ResponseType};
pub use error::{BiosError, SdError, E_OK};

use crate::mailbox::{ClockId, DeviceId, PowerRequest, PowerStatus, PropertyChannel};
use card::ocr;
use core::fmt::Write as _;
use registers::{regs, status, Control0, Control1, Interrupt};
use stos_hal::timer::{wait_for, Clock};
use stos_hal::{mmio::RegisterBus, HalResult};

/// Sector size
pub const BLOCK_SIZE: usize = 512;

/// Sectors reported by the disk info request
pub const DISK_INFO_BLOCKS: u32 = 31_250_000;

const DEFAULT_CMD_TIMEOUT_US: u32 = 500_000;
const SDIO_PROBE_TIMEOUT_US: u32 = 10_000;
const LINE_RESET_TIMEOUT_US: u32 = 1_000_000;
const CARD_DETECT_TIMEOUT_US: u32 = 500_000;
const OP_COND_POLL_DELAY_US: u32 = 500_000;

/// SEND_IF_COND argument: 2.7-3.6V and check pattern 0xAA
const IF_COND_CHECK: u32 = 0x1AA;

/// Data timeout of TMCLK * 2^24
const DATA_TIMEOUT_EXPONENT: u32 = 11;

/// Reset attempts: one normal, one after a failed 1.8V switch
const MAX_RESET_ATTEMPTS: usize = 2;

/// SET_BUS_WIDTH argument for 4 data lines
const BUS_WIDTH_4: u32 = 2;

/// Driver configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmmcConfig {
    /// Refuse every write request
    pub write_protect: bool,
    /// Ask the card for 1.8V signalling
    pub enable_1_8v: bool,
    /// Switch to a 4-bit bus when the card supports it
    pub enable_4bit: bool,
    /// Deliver card interrupts to the INTERRUPT register
    pub card_interrupts: bool,
    /// Base clock used when the firmware does not report one
    pub default_base_clock: u32,
    /// Timeout of block read/write commands
    pub data_timeout_us: u32,
    /// Attempts per block read/write command
    pub max_retries: u32,
    /// SD_SEND_OP_COND polls before giving up on a busy card
    pub op_cond_polls: u32,
}

impl EmmcConfig {
    /// Default configuration: read-only, 3.3V, 4-bit bus
    pub const fn new() -> Self {
        Self {
            write_protect: true,
            enable_1_8v: false,
            enable_4bit: true,
            card_interrupts: false,
            default_base_clock: 100_000_000,
            data_timeout_us: 5_000_000,
            max_retries: 3,
            op_cond_polls: 20,
        }
    }
}

impl Default for EmmcConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of the most recent command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Last command issued, `None` before the first one
    pub command: Option<Command>,
    /// Whether it completed
    pub success: bool,
    /// Error half of the interrupt status
    pub error: Interrupt,
    /// Raw interrupt status at the failure
    pub interrupt: u32,
    /// Response registers
    pub response: [u32; 4],
}

impl CommandOutcome {
    const fn new() -> Self {
        Self {
            command: None,
            success: false,
            error: Interrupt::empty(),
            interrupt: 0,
            response: [0; 4],
        }
    }

    fn failed_with(&self, flag: Interrupt) -> bool {
        !self.success && self.error.intersects(flag)
    }

    /// Failed without any status bit: software timeout
    pub fn timeout(&self) -> bool {
        !self.success && self.error.is_empty()
    }

    /// Command timeout
    pub fn command_timeout(&self) -> bool {
        self.failed_with(Interrupt::CTO_ERR)
    }

    /// Command CRC error
    pub fn command_crc(&self) -> bool {
        self.failed_with(Interrupt::CCRC_ERR)
    }

    /// Command end bit error
    pub fn command_end_bit(&self) -> bool {
        self.failed_with(Interrupt::CEND_ERR)
    }

    /// Command index error
    pub fn command_index(&self) -> bool {
        self.failed_with(Interrupt::CBAD_ERR)
    }

    /// Data timeout
    pub fn data_timeout(&self) -> bool {
        self.failed_with(Interrupt::DTO_ERR)
    }

    /// Data CRC error
    pub fn data_crc(&self) -> bool {
        self.failed_with(Interrupt::DCRC_ERR)
    }

    /// Data end bit error
    pub fn data_end_bit(&self) -> bool {
        self.failed_with(Interrupt::DEND_ERR)
    }

    /// Current limit error
    pub fn current_limit(&self) -> bool {
        self.failed_with(Interrupt::CURRENT_LIMIT)
    }

    /// Auto CMD12 error
    pub fn auto_cmd12(&self) -> bool {
        self.failed_with(Interrupt::ACMD_ERR)
    }

    /// ADMA error
    pub fn adma(&self) -> bool {
        self.failed_with(Interrupt::ADMA_ERR)
    }

    /// Tuning error
    pub fn tuning(&self) -> bool {
        self.failed_with(Interrupt::TUNING_ERR)
    }
}

impl Default for CommandOutcome {
    fn default() -> Self {
        Self::new()
    }
}

/// Data phase of a command
enum Transfer<'a> {
    None,
    Read(&'a mut [u32]),
    Write(&'a [u32]),
}

impl Transfer<'_> {
    fn words(&self) -> usize {
        match self {
            Transfer::None => 0,
            Transfer::Read(buf) => buf.len(),
            Transfer::Write(buf) => buf.len(),
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, Transfer::Write(_))
    }

    fn reborrow(&mut self) -> Transfer<'_> {
        match self {
            Transfer::None => Transfer::None,
            Transfer::Read(buf) => Transfer::Read(&mut **buf),
            Transfer::Write(buf) => Transfer::Write(*buf),
        }
    }
}

/// Caller buffer of a block request
#[derive(Debug)]
pub enum BlockIo<'a> {
    /// Read sectors into the buffer
    Read(&'a mut [u8]),
    /// Write sectors from the buffer
    Write(&'a [u8]),
}

impl BlockIo<'_> {
    /// Whether this is a write
    pub fn is_write(&self) -> bool {
        matches!(self, BlockIo::Write(_))
    }
}

/// Block-device control requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlRequest {
    /// Sector count and size
    DiskInfo,
    /// Name derived from the CID
    DiskName,
    /// Whether the medium changed since the last query
    MediaChange,
    /// Anything else
    Other(u16),
}

impl IoctlRequest {
    /// Decode a legacy request code
    pub const fn from_code(code: u16) -> Self {
        match code {
            0 => IoctlRequest::DiskInfo,
            1 => IoctlRequest::DiskName,
            2 => IoctlRequest::MediaChange,
            other => IoctlRequest::Other(other),
        }
    }
}

/// Media change report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MediaState {
    /// Same medium
    Unchanged = 0,
    /// Medium was replaced
    Changed = 2,
}

/// Answer to an [`IoctlRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlResponse {
    /// Geometry
    DiskInfo {
        /// Number of sectors
        blocks: u32,
        /// Sector size in bytes
        block_size: u32,
    },
    /// 32 hex digits of the CID
    DiskName(heapless::String<32>),
    /// Media change state
    MediaChange(MediaState),
}

enum ResetOutcome {
    Ready,
    VoltageSwitchFailed(&'static str),
}

/// The SD card driver
pub struct Emmc<B, K, F> {
    bus: B,
    clock: K,
    firmware: F,
    config: EmmcConfig,
    card: CardInfo,
    last: CommandOutcome,
    block_size: u32,
    card_removed: bool,
    media_changed: bool,
    failed_voltage_switch: bool,
}

impl<B, K, F> Emmc<B, K, F>
where
    B: RegisterBus,
    K: Clock,
    F: PropertyChannel,
{
    /// Create the driver; nothing touches the hardware until [`Self::init`]
    pub fn new(bus: B, clock: K, firmware: F, config: EmmcConfig) -> Self {
        Self {
            bus,
            clock,
            firmware,
            config,
            card: CardInfo::new(),
            last: CommandOutcome::new(),
            block_size: BLOCK_SIZE as u32,
            card_removed: false,
            media_changed: false,
            failed_voltage_switch: false,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &EmmcConfig {
        &self.config
    }

    /// What is known about the card
    pub fn card(&self) -> &CardInfo {
        &self.card
    }

    /// Outcome of the most recent command
    pub fn last_command(&self) -> &CommandOutcome {
        &self.last
    }

    /// Whether 1.8V signalling failed and is no longer attempted
    pub fn voltage_switch_failed(&self) -> bool {
        self.failed_voltage_switch
    }

    /// Power the slot, read the controller version and initialize the card
    pub fn init(&mut self) -> Result<(), SdError> {
        self.failed_voltage_switch = false;
        self.power_on()?;

        let version = self.bus.read32(regs::SLOTISR_VER);
        self.card.hci_version = (version >> 16) & 0xFF;
        log::debug!(
            "emmc: vendor {:#x}, SDHCI version {:#x}, slot status {:#x}",
            version >> 24,
            self.card.hci_version,
            version & 0xFF
        );
        if self.card.hci_version < registers::hci_version::V3 {
            log::warn!("emmc: old SDHCI version {}", self.card.hci_version);
        }

        self.card_reset()
    }

    // =========================================================================
    // POWER AND CLOCKS
    // =========================================================================

    fn power_on(&mut self) -> Result<(), SdError> {
        match self
            .firmware
            .set_power_state(DeviceId::SdCard, PowerRequest::ON | PowerRequest::WAIT)
        {
            Ok(state) if state.contains(PowerStatus::ON) && !state.contains(PowerStatus::NO_DEVICE) => {
                Ok(())
            }
            Ok(state) => {
                log::error!("emmc: slot did not power on ({:?})", state);
                Err(SdError::PowerOn)
            }
            Err(err) => {
                log::error!("emmc: power request failed: {}", err);
                Err(SdError::PowerOn)
            }
        }
    }

    fn power_off(&mut self) {
        self.bus
            .clear_bits(regs::CONTROL0, (Control0::SIGNAL_1V8 | Control0::BUS_VOLTAGE).bits());
    }

    fn base_clock(&mut self) -> u32 {
        match self.firmware.clock_rate(ClockId::Emmc) {
            Ok(rate) if rate != 0 => rate,
            result => {
                log::warn!(
                    "emmc: no base clock from firmware ({:?}), assuming {} Hz",
                    result,
                    self.config.default_base_clock
                );
                self.config.default_base_clock
            }
        }
    }

    /// Change the card clock with the card idle
    pub fn switch_clock_rate(&mut self, base: u32, target: u32) -> Result<(), SdError> {
        let field = clock::divider(base, target);

        self.wait_reg(regs::STATUS, status::CMD_INHIBIT | status::DAT_INHIBIT, false, LINE_RESET_TIMEOUT_US)
            .map_err(|_| SdError::InhibitTimeout)?;

        let mut control1 = self.bus.read32(regs::CONTROL1) & !Control1::CLK_EN.bits();
        self.bus.write32(regs::CONTROL1, control1);
        self.clock.delay_us(2000);

        control1 = (control1 & !Control1::CLOCK_FIELD) | field;
        self.bus.write32(regs::CONTROL1, control1);
        self.clock.delay_us(2000);

        self.bus.write32(regs::CONTROL1, control1 | Control1::CLK_EN.bits());
        self.clock.delay_us(2000);

        log::debug!("emmc: card clock {} Hz", clock::rate(base, field));
        Ok(())
    }

    fn reset_line(&mut self, bit: Control1) -> Result<(), SdError> {
        self.bus.set_bits(regs::CONTROL1, bit.bits());
        self.wait_reg(regs::CONTROL1, bit.bits(), false, LINE_RESET_TIMEOUT_US)
            .map_err(|_| {
                log::warn!("emmc: {:?} line did not reset", bit);
                SdError::LineResetTimeout
            })
    }

    fn reset_cmd(&mut self) -> Result<(), SdError> {
        self.reset_line(Control1::SRST_CMD)
    }

    fn reset_dat(&mut self) -> Result<(), SdError> {
        self.reset_line(Control1::SRST_DATA)
    }

    /// Poll until any bit of `mask` is set, or all are clear
    fn wait_reg(&self, offset: usize, mask: u32, set: bool, timeout_us: u32) -> HalResult<()> {
        wait_for(&self.clock, timeout_us, || (self.bus.read32(offset) & mask != 0) == set)
    }

    fn wait_interrupt(&self, flag: Interrupt, timeout_us: u32) -> HalResult<()> {
        self.wait_reg(regs::INTERRUPT, (flag | Interrupt::ERR).bits(), true, timeout_us)
    }

    // =========================================================================
    // COMMAND ENGINE
    // =========================================================================

    /// Issue `command`, wrapping application commands in APP_CMD
    pub fn issue_command(&mut self, command: Command, argument: u32, timeout_us: u32) -> Result<(), SdError> {
        self.issue(command, argument, timeout_us, Transfer::None)
    }

    fn issue(&mut self, command: Command, argument: u32, timeout_us: u32, data: Transfer<'_>) -> Result<(), SdError> {
        let word = command.word();
        if word.is_reserved() {
            log::warn!("emmc: invalid command {}", command);
            self.last = CommandOutcome {
                command: Some(command),
                ..CommandOutcome::new()
            };
            return Err(SdError::ReservedCommand(command));
        }
        if data.words() / self.block_words() > 0xFFFF {
            log::warn!("emmc: {} with more than 65535 blocks", command);
            return Err(SdError::TooManyBlocks);
        }

        self.handle_interrupts();

        if self.card_removed {
            self.card.rca = 0;
            self.last.success = false;
            return Err(SdError::CardRemoved);
        }

        if command.is_app() {
            let app = Command::APP_CMD;
            self.issue_low(app, app.word(), self.card.rca_argument(), timeout_us, Transfer::None)?;
        }

        let result = self.issue_low(command, word, argument, timeout_us, data);
        if let Err(err) = result {
            log::debug!("emmc: {} (irq {:#010x})", err, self.last.interrupt);
        }
        result
    }

    fn block_words(&self) -> usize {
        (self.block_size / 4).max(1) as usize
    }

    fn issue_low(
        &mut self,
        command: Command,
        word: CommandWord,
        argument: u32,
        timeout_us: u32,
        mut data: Transfer<'_>,
    ) -> Result<(), SdError> {
        self.last = CommandOutcome {
            command: Some(command),
            ..CommandOutcome::new()
        };

        let block_words = self.block_words();
        let blocks = data.words() / block_words;

        self.bus.write32(regs::BLKSIZECNT, self.block_size | ((blocks as u32) << 16));
        self.bus.write32(regs::ARG1, argument);
        self.bus.write32(regs::CMDTM, word.bits());

        // Timeouts show up as missing bits below
        let _ = self.wait_interrupt(Interrupt::CMD_DONE, timeout_us);
        let irpts = self.bus.read32(regs::INTERRUPT);
        self.bus.write32(regs::INTERRUPT, Interrupt::ERROR_MASK | Interrupt::CMD_DONE.bits());
        if irpts & (Interrupt::ERROR_MASK | Interrupt::CMD_DONE.bits()) != Interrupt::CMD_DONE.bits() {
            return Err(self.fail(irpts));
        }

        match word.response() {
            ResponseType::Short | ResponseType::ShortBusy => {
                self.last.response[0] = self.bus.read32(regs::RESP0);
            }
            ResponseType::Long => {
                self.last.response = [
                    self.bus.read32(regs::RESP0),
                    self.bus.read32(regs::RESP1),
                    self.bus.read32(regs::RESP2),
                    self.bus.read32(regs::RESP3),
                ];
            }
            ResponseType::None => {}
        }

        if word.has_data() {
            let ready = if word.is_read() {
                Interrupt::READ_RDY
            } else {
                Interrupt::WRITE_RDY
            };
            let expect = ready.bits();
            for block in 0..blocks {
                let _ = self.wait_interrupt(ready, timeout_us);
                let irpts = self.bus.read32(regs::INTERRUPT);
                self.bus.write32(regs::INTERRUPT, Interrupt::ERROR_MASK | expect);
                if irpts & (Interrupt::ERROR_MASK | expect) != expect {
                    return Err(self.fail(irpts));
                }

                let range = block * block_words..(block + 1) * block_words;
                match &mut data {
                    Transfer::Read(buf) => {
                        for slot in &mut buf[range] {
                            *slot = self.bus.read32(regs::DATA);
                        }
                    }
                    Transfer::Write(buf) => {
                        for value in &buf[range] {
                            self.bus.write32(regs::DATA, *value);
                        }
                    }
                    Transfer::None => {}
                }
            }
        }

        if word.waits_for_transfer() {
            let done = Interrupt::DATA_DONE.bits();
            let _ = self.wait_interrupt(Interrupt::DATA_DONE, timeout_us);
            let irpts = self.bus.read32(regs::INTERRUPT);
            self.bus.write32(regs::INTERRUPT, Interrupt::ERROR_MASK | done);

            // Transfer complete overrides a simultaneous data timeout
            let seen = irpts & (Interrupt::ERROR_MASK | done);
            if seen != done && seen != (Interrupt::DTO_ERR.bits() | done) {
                return Err(self.fail(irpts));
            }
            self.bus.write32(regs::INTERRUPT, Interrupt::ERROR_MASK | done);
        }

        self.last.success = true;
        Ok(())
    }

    fn fail(&mut self, irpts: u32) -> SdError {
        let error = Interrupt::from_bits_truncate(irpts & Interrupt::ERROR_MASK);
        self.last.success = false;
        self.last.error = error;
        self.last.interrupt = irpts;
        let command = self.last.command.unwrap_or(Command::GO_IDLE_STATE);
        if error.is_empty() {
            SdError::Timeout(command)
        } else {
            SdError::Command { command, error }
        }
    }

    /// Acknowledge stale status before a new command
    fn handle_interrupts(&mut self) {
        let irpts = Interrupt::from_bits_truncate(self.bus.read32(regs::INTERRUPT));
        let mut reset = Interrupt::empty();

        let stale = Interrupt::CMD_DONE
            | Interrupt::DATA_DONE
            | Interrupt::BLOCK_GAP
            | Interrupt::DMA
            | Interrupt::CARD_INSERTION;
        if irpts.intersects(stale) {
            log::trace!("emmc: spurious status {:?}", irpts & stale);
            reset |= irpts & stale;
        }

        let buffer = Interrupt::WRITE_RDY | Interrupt::READ_RDY;
        if irpts.intersects(buffer) {
            log::debug!("emmc: spurious buffer ready");
            reset |= irpts & buffer;
            // A stuck DAT line surfaces on the next data command
            let _ = self.reset_dat();
        }

        if irpts.contains(Interrupt::CARD_REMOVAL) {
            log::info!("emmc: card removed");
            reset |= Interrupt::CARD_REMOVAL;
            self.card_removed = true;
            self.media_changed = true;
        }

        if irpts.contains(Interrupt::CARD) {
            self.handle_card_interrupt();
            reset |= Interrupt::CARD;
        }

        let mut bits = reset.bits();
        if irpts.contains(Interrupt::ERR) {
            log::debug!("emmc: spurious error status {:?}", irpts);
            bits |= Interrupt::ERROR_MASK;
        }
        self.bus.write32(regs::INTERRUPT, bits);
    }

    fn handle_card_interrupt(&mut self) {
        if self.card.rca == 0 {
            log::debug!("emmc: card interrupt with no card selected");
            return;
        }
        let cmd = Command::SEND_STATUS;
        match self.issue_low(cmd, cmd.word(), self.card.rca_argument(), DEFAULT_CMD_TIMEOUT_US, Transfer::None) {
            Ok(()) => log::debug!("emmc: card interrupt, status {:#010x}", self.last.response[0]),
            Err(err) => log::warn!("emmc: card interrupt, no status: {}", err),
        }
    }

    // =========================================================================
    // CARD INITIALIZATION
    // =========================================================================

    /// Reset the controller and enumerate the card
    ///
    /// A failed 1.8V switch powers the bus down and starts over once at
    /// 3.3V; the second attempt never asks for 1.8V again.
    pub fn card_reset(&mut self) -> Result<(), SdError> {
        for _ in 0..MAX_RESET_ATTEMPTS {
            match self.reset_once()? {
                ResetOutcome::Ready => return Ok(()),
                ResetOutcome::VoltageSwitchFailed(reason) => {
                    log::warn!("emmc: 1.8V switch failed ({}), retrying at 3.3V", reason);
                    self.failed_voltage_switch = true;
                    self.power_off();
                }
            }
        }
        Err(SdError::VoltageSwitch)
    }

    fn reset_once(&mut self) -> Result<ResetOutcome, SdError> {
        let control1 = (self.bus.read32(regs::CONTROL1) | Control1::SRST_HC.bits())
            & !(Control1::CLK_EN | Control1::CLK_INTLEN).bits();
        self.bus.write32(regs::CONTROL1, control1);
        self.wait_reg(regs::CONTROL1, Control1::RESET_ALL, false, LINE_RESET_TIMEOUT_US)
            .map_err(|_| {
                log::error!("emmc: controller did not reset");
                SdError::ControllerResetTimeout
            })?;

        let _ = self.wait_reg(regs::STATUS, status::CARD_INSERTED, true, CARD_DETECT_TIMEOUT_US);
        if self.bus.read32(regs::STATUS) & status::CARD_INSERTED == 0 {
            log::error!("emmc: no card inserted");
            return Err(SdError::NoCard);
        }

        self.bus.write32(regs::CONTROL2, 0);

        let base_clock = self.base_clock();
        let mut control1 = self.bus.read32(regs::CONTROL1) & !Control1::CLOCK_FIELD;
        control1 |= Control1::CLK_INTLEN.bits();
        control1 |= clock::divider(base_clock, clock::SD_CLOCK_ID);
        control1 &= !Control1::DATA_TOUNIT.bits();
        control1 |= DATA_TIMEOUT_EXPONENT << Control1::DATA_TOUNIT_SHIFT;
        self.bus.write32(regs::CONTROL1, control1);
        self.wait_reg(regs::CONTROL1, Control1::CLK_STABLE.bits(), true, LINE_RESET_TIMEOUT_US)
            .map_err(|_| {
                log::error!("emmc: clock did not stabilise");
                SdError::ClockStableTimeout
            })?;

        self.clock.delay_us(2000);
        self.bus.set_bits(regs::CONTROL1, Control1::CLK_EN.bits());
        self.clock.delay_us(2000);

        self.bus.write32(regs::IRPT_EN, 0);
        self.bus.write32(regs::INTERRUPT, u32::MAX);
        let mut mask = !Interrupt::CARD.bits();
        if self.config.card_interrupts {
            mask |= Interrupt::CARD.bits();
        }
        self.bus.write32(regs::IRPT_MASK, mask);
        self.clock.delay_us(2000);

        self.card = CardInfo {
            hci_version: self.card.hci_version,
            base_clock,
            ..CardInfo::new()
        };
        self.last = CommandOutcome::new();
        self.block_size = BLOCK_SIZE as u32;
        self.card_removed = false;

        self.issue_command(Command::GO_IDLE_STATE, 0, DEFAULT_CMD_TIMEOUT_US)
            .map_err(|_| {
                log::error!("emmc: no GO_IDLE_STATE response");
                SdError::GoIdle
            })?;

        let v2_later = self.check_interface_condition()?;
        self.probe_sdio()?;
        self.negotiate_op_cond(v2_later)?;

        self.switch_clock_rate(base_clock, clock::SD_CLOCK_NORMAL)?;
        self.clock.delay_us(5000);

        if self.card.supports_18v {
            if let Err(reason) = self.switch_to_1v8() {
                return Ok(ResetOutcome::VoltageSwitchFailed(reason));
            }
            log::info!("emmc: 1.8V signalling enabled");
        }

        self.issue_command(Command::ALL_SEND_CID, 0, DEFAULT_CMD_TIMEOUT_US)
            .map_err(|_| SdError::Identify)?;
        self.card.cid = self.last.response;

        self.issue_command(Command::SEND_RELATIVE_ADDR, 0, DEFAULT_CMD_TIMEOUT_US)
            .map_err(|_| SdError::RelativeAddress)?;
        let response = RcaResponse(self.last.response[0]);
        if !response.is_usable() {
            log::error!("emmc: SEND_RELATIVE_ADDR response {:#010x}", response.0);
            return Err(SdError::AddressResponse { status: response.0 });
        }
        self.card.rca = response.rca();

        self.issue_command(Command::SELECT_CARD, self.card.rca_argument(), DEFAULT_CMD_TIMEOUT_US)
            .map_err(|_| SdError::Select)?;
        let state = CardStatus(self.last.response[0]).current_state();
        if !matches!(state, CardState::Stby | CardState::Tran) {
            let raw = (self.last.response[0] >> 9) & 0xF;
            log::error!("emmc: invalid state {} after SELECT_CARD", raw);
            return Err(SdError::SelectState(raw));
        }

        if !self.card.sdhc {
            self.issue_command(Command::SET_BLOCKLEN, BLOCK_SIZE as u32, DEFAULT_CMD_TIMEOUT_US)
                .map_err(|_| SdError::BlockLength)?;
        }
        let blksizecnt = (self.bus.read32(regs::BLKSIZECNT) & !0xFFF) | BLOCK_SIZE as u32;
        self.bus.write32(regs::BLKSIZECNT, blksizecnt);

        self.read_scr()?;

        if self.card.scr.supports_4bit() && self.config.enable_4bit {
            self.switch_bus_width();
        }

        log::info!(
            "emmc: SD {} card, RCA {:#06x}, {}",
            self.card.scr.sd_version().as_str(),
            self.card.rca,
            if self.card.sdhc { "SDHC" } else { "SDSC" }
        );

        self.bus.write32(regs::INTERRUPT, u32::MAX);
        Ok(ResetOutcome::Ready)
    }

    /// SEND_IF_COND; a timeout marks a card older than 2.0
    fn check_interface_condition(&mut self) -> Result<bool, SdError> {
        match self.issue_command(Command::SEND_IF_COND, IF_COND_CHECK, DEFAULT_CMD_TIMEOUT_US) {
            Ok(()) => {
                let echo = self.last.response[0];
                if echo & 0xFFF != IF_COND_CHECK {
                    log::error!("emmc: unusable card, SEND_IF_COND echoed {:#x}", echo);
                    return Err(SdError::VoltageCheck(echo));
                }
                Ok(true)
            }
            Err(_) if self.last.timeout() => {
                log::warn!("emmc: no SEND_IF_COND response, assuming SD 1.x card");
                Ok(false)
            }
            Err(_) if self.last.command_timeout() => {
                log::warn!("emmc: SEND_IF_COND timed out, assuming SD 1.x card");
                self.reset_cmd()?;
                self.bus.write32(regs::INTERRUPT, Interrupt::CTO_ERR.bits());
                Ok(false)
            }
            Err(err) => {
                log::error!("emmc: {}", err);
                Err(SdError::InterfaceCondition)
            }
        }
    }

    /// IO_SET_OP_COND is only answered by SDIO cards
    fn probe_sdio(&mut self) -> Result<(), SdError> {
        let result = self.issue_command(Command::IO_SET_OP_COND, 0, SDIO_PROBE_TIMEOUT_US);
        if result.is_err() && self.last.timeout() {
            return Ok(());
        }
        if self.last.command_timeout() {
            self.reset_cmd()?;
            self.bus.write32(regs::INTERRUPT, Interrupt::CTO_ERR.bits());
            return Ok(());
        }
        log::error!("emmc: SDIO card detected, not supported");
        Err(SdError::SdioCard)
    }

    fn negotiate_op_cond(&mut self, v2_later: bool) -> Result<(), SdError> {
        self.issue_command(Command::SD_SEND_OP_COND, 0, DEFAULT_CMD_TIMEOUT_US)
            .map_err(|_| {
                log::error!("emmc: inquiry ACMD41 failed");
                SdError::OpCondInquiry
            })?;

        let want_18v = v2_later && self.config.enable_1_8v && !self.failed_voltage_switch;
        let mut flags = 0;
        if v2_later {
            flags |= ocr::HCS | ocr::XPC;
        }
        if want_18v {
            flags |= ocr::S18A;
        }

        for _ in 0..self.config.op_cond_polls {
            self.issue_command(Command::SD_SEND_OP_COND, ocr::VOLTAGE_WINDOW | flags, DEFAULT_CMD_TIMEOUT_US)
                .map_err(|_| {
                    log::error!("emmc: ACMD41 failed");
                    SdError::OpCond
                })?;

            let response = self.last.response[0];
            if response & ocr::READY != 0 {
                self.card.ocr = (response >> 8) & 0xFFFF;
                self.card.sdhc = response & ocr::HCS != 0;
                self.card.supports_18v = want_18v && response & ocr::S18A != 0;
                log::debug!(
                    "emmc: OCR {:#06x}, SDHC {}, 1.8V {}",
                    self.card.ocr,
                    self.card.sdhc,
                    self.card.supports_18v
                );
                return Ok(());
            }
            self.clock.delay_us(OP_COND_POLL_DELAY_US);
        }

        log::error!("emmc: card still busy after {} ACMD41 polls", self.config.op_cond_polls);
        Err(SdError::OpCondTimeout)
    }

    fn dat_level(&self) -> u32 {
        (self.bus.read32(regs::STATUS) & status::DAT_LEVEL) >> status::DAT_LEVEL_SHIFT
    }

    fn switch_to_1v8(&mut self) -> Result<(), &'static str> {
        if self.issue_command(Command::VOLTAGE_SWITCH, 0, DEFAULT_CMD_TIMEOUT_US).is_err() {
            return Err("VOLTAGE_SWITCH failed");
        }

        self.bus.clear_bits(regs::CONTROL1, Control1::CLK_EN.bits());
        if self.dat_level() != 0 {
            return Err("DAT[3:0] did not settle to 0");
        }

        self.bus.set_bits(regs::CONTROL0, Control0::SIGNAL_1V8.bits());
        self.clock.delay_us(5000);
        if self.bus.read32(regs::CONTROL0) & Control0::SIGNAL_1V8.bits() == 0 {
            return Err("controller dropped 1.8V signal enable");
        }

        self.bus.set_bits(regs::CONTROL1, Control1::CLK_EN.bits());
        self.clock.delay_us(10_000);
        if self.dat_level() != 0xF {
            return Err("DAT[3:0] did not settle to 1111b");
        }
        Ok(())
    }

    fn read_scr(&mut self) -> Result<(), SdError> {
        let mut words = [0u32; 2];
        self.block_size = 8;
        let result = self.issue(
            Command::SEND_SCR,
            0,
            DEFAULT_CMD_TIMEOUT_US,
            Transfer::Read(&mut words),
        );
        self.block_size = BLOCK_SIZE as u32;
        result.map_err(|err| {
            log::error!("emmc: {}", err);
            SdError::ReadScr
        })?;

        self.card.scr = Scr::from_fifo(words);
        log::debug!("emmc: SCR {:02x?}", self.card.scr.raw);
        Ok(())
    }

    /// ACMD6 with card interrupts masked; the mask is restored either way
    fn switch_bus_width(&mut self) {
        let old_mask = self.bus.read32(regs::IRPT_MASK);
        self.bus.write32(regs::IRPT_MASK, old_mask & !Interrupt::CARD.bits());

        match self.issue_command(Command::SET_BUS_WIDTH, BUS_WIDTH_4, DEFAULT_CMD_TIMEOUT_US) {
            Ok(()) => {
                self.bus.set_bits(regs::CONTROL0, Control0::HCTL_DWIDTH.bits());
                log::info!("emmc: 4-bit data bus");
            }
            Err(err) => log::warn!("emmc: switch to 4-bit bus failed: {}", err),
        }

        self.bus.write32(regs::IRPT_MASK, old_mask);
    }

    // =========================================================================
    // DATA TRANSFER
    // =========================================================================

    /// Bring the card into the transfer state
    pub fn ensure_data_mode(&mut self) -> Result<(), SdError> {
        if self.card.rca == 0 {
            self.card_reset()?;
        }

        match self.query_state()?.current_state() {
            CardState::Tran => return Ok(()),
            CardState::Stby => {
                if self
                    .issue_command(Command::SELECT_CARD, self.card.rca_argument(), DEFAULT_CMD_TIMEOUT_US)
                    .is_err()
                {
                    log::warn!("emmc: SELECT_CARD failed");
                    self.card.rca = 0;
                    return Err(SdError::Select);
                }
            }
            CardState::Data => {
                if self
                    .issue_command(Command::STOP_TRANSMISSION, 0, DEFAULT_CMD_TIMEOUT_US)
                    .is_err()
                {
                    log::warn!("emmc: STOP_TRANSMISSION failed");
                    self.card.rca = 0;
                    return Err(SdError::StopTransmission);
                }
                let _ = self.reset_dat();
            }
            _ => self.card_reset()?,
        }

        let status = self.query_state()?;
        if status.current_state() != CardState::Tran {
            log::warn!("emmc: card stuck in state {}", status.state_code());
            self.card.rca = 0;
            return Err(SdError::NotInTransferState(status.state_code()));
        }
        Ok(())
    }

    fn query_state(&mut self) -> Result<CardStatus, SdError> {
        if let Err(err) = self.issue_command(Command::SEND_STATUS, self.card.rca_argument(), DEFAULT_CMD_TIMEOUT_US) {
            log::warn!("emmc: SEND_STATUS: {}", err);
            self.card.rca = 0;
            return Err(SdError::SendStatus);
        }
        let status = CardStatus(self.last.response[0]);
        if status.has_errors() {
            log::debug!("emmc: card status {:#010x} reports errors", status.0);
        }
        Ok(status)
    }

    fn do_data_command(&mut self, mut data: Transfer<'_>, block_no: u32) -> Result<(), SdError> {
        let address = block_address(self.card.sdhc, block_no).ok_or(SdError::AddressOutOfRange)?;

        let blocks = data.words() / (BLOCK_SIZE / 4);
        if blocks < 1 {
            return Err(SdError::EmptyTransfer);
        }

        let command = match (data.is_write(), blocks > 1) {
            (true, true) => Command::WRITE_MULTIPLE_BLOCK,
            (true, false) => Command::WRITE_BLOCK,
            (false, true) => Command::READ_MULTIPLE_BLOCK,
            (false, false) => Command::READ_SINGLE_BLOCK,
        };

        let max_retries = self.config.max_retries.max(1);
        for attempt in 1..=max_retries {
            match self.issue(command, address, self.config.data_timeout_us, data.reborrow()) {
                Ok(()) => return Ok(()),
                Err(err) => log::warn!("emmc: {} attempt {}/{}: {}", command, attempt, max_retries, err),
            }
        }

        log::error!("emmc: giving up on {} at block {}", command, block_no);
        self.card.rca = 0;
        Err(SdError::RetriesExhausted)
    }

    fn do_rw(&mut self, data: Transfer<'_>, block_no: u32) -> Result<usize, SdError> {
        self.ensure_data_mode()?;
        let blocks = data.words() / (BLOCK_SIZE / 4);
        self.do_data_command(data, block_no)?;
        Ok(blocks)
    }

    // =========================================================================
    // BLOCK DEVICE INTERFACE
    // =========================================================================

    /// Read or write `count` sectors starting at `sector`
    pub fn read_write(&mut self, io: BlockIo<'_>, sector: u32, count: u16, device: u16) -> Result<(), BiosError> {
        if device != 0 {
            return Err(BiosError::UnknownDevice);
        }
        if count == 0 {
            return Ok(());
        }
        if io.is_write() && self.config.write_protect {
            log::warn!("emmc: refusing write of {} sectors at {}", count, sector);
            return Err(BiosError::WriteProtected);
        }

        let bytes = usize::from(count) * BLOCK_SIZE;
        let (result, fault) = match io {
            BlockIo::Read(buf) => {
                let words = buf.get_mut(..bytes).ok_or(SdError::BufferTooSmall).and_then(as_words_mut);
                (words.and_then(|w| self.do_rw(Transfer::Read(w), sector)), BiosError::ReadFault)
            }
            BlockIo::Write(buf) => {
                let words = buf.get(..bytes).ok_or(SdError::BufferTooSmall).and_then(as_words);
                (words.and_then(|w| self.do_rw(Transfer::Write(w), sector)), BiosError::WriteFault)
            }
        };

        match result {
            Ok(_) => Ok(()),
            Err(err @ (SdError::BufferTooSmall | SdError::MisalignedBuffer)) => {
                log::error!("emmc: bad request buffer: {}", err);
                Err(BiosError::Err)
            }
            Err(err) => {
                log::warn!("emmc: sector {} x{}: {}", sector, count, err);
                Err(fault)
            }
        }
    }

    /// Miscellaneous non-transfer requests
    pub fn ioctl(&mut self, device: u16, request: IoctlRequest) -> Result<IoctlResponse, BiosError> {
        if device != 0 {
            return Err(BiosError::UnknownDevice);
        }

        if let Err(err) = self.ensure_data_mode() {
            log::debug!("emmc: ioctl on unready card: {}", err);
        }
        if self.card_removed {
            return match request {
                IoctlRequest::MediaChange => {
                    self.media_changed = false;
                    Ok(IoctlResponse::MediaChange(MediaState::Changed))
                }
                _ => Err(BiosError::MediaChanged),
            };
        }

        match request {
            IoctlRequest::DiskInfo => Ok(IoctlResponse::DiskInfo {
                blocks: DISK_INFO_BLOCKS,
                block_size: BLOCK_SIZE as u32,
            }),
            IoctlRequest::DiskName => {
                let cid = &self.card.cid;
                let mut name = heapless::String::new();
                write!(name, "{:08x}{:08x}{:08x}{:08x}", cid[3], cid[2], cid[1], cid[0])
                    .map_err(|_| BiosError::Err)?;
                Ok(IoctlResponse::DiskName(name))
            }
            IoctlRequest::MediaChange => {
                let state = if core::mem::take(&mut self.media_changed) {
                    MediaState::Changed
                } else {
                    MediaState::Unchanged
                };
                Ok(IoctlResponse::MediaChange(state))
            }
            IoctlRequest::Other(code) => {
                log::debug!("emmc: unsupported ioctl {}", code);
                Err(BiosError::Err)
            }
        }
    }
}

/// Command argument addressing `block`
///
/// SDHC/SDXC cards take block numbers, SDSC cards byte offsets.
pub fn block_address(sdhc: bool, block: u32) -> Option<u32> {
    if sdhc {
        Some(block)
    } else {
        block.checked_mul(BLOCK_SIZE as u32)
    }
}

fn as_words_mut(buf: &mut [u8]) -> Result<&mut [u32], SdError> {
    // SAFETY: every bit pattern is a valid u32
    let (head, words, tail) = unsafe { buf.align_to_mut::<u32>() };
    if !head.is_empty() || !tail.is_empty() {
        return Err(SdError::MisalignedBuffer);
    }
    Ok(words)
}

fn as_words(buf: &[u8]) -> Result<&[u32], SdError> {
    // SAFETY: every bit pattern is a valid u32
    let (head, words, tail) = unsafe { buf.align_to::<u32>() };
    if !head.is_empty() || !tail.is_empty() {
        return Err(SdError::MisalignedBuffer);
    }
    Ok(words)
}

impl<B: core::fmt::Debug, K, F> core::fmt::Debug for Emmc<B, K, F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Emmc")
            .field("bus", &self.bus)
            .field("card", &self.card)
            .field("last", &self.last)
            .field("card_removed", &self.card_removed)
            .finish_non_exhaustive()
    }
}
