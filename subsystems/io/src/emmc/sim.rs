//! Scripted SDHCI controller with an SD card behind it

use super::card::ocr;
use super::commands::Command;
use super::registers::{regs, status, Control0, Control1, Interrupt};
use super::{Emmc, EmmcConfig};
use crate::mailbox::{ClockId, DeviceId, MailboxError, PowerRequest, PowerStatus, PropertyChannel};
use crate::testing::VirtualClock;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::vec::Vec;
use stos_hal::mmio::RegisterBus;

pub const CID: [u32; 4] = [0x1111_1111, 0x2222_2222, 0x3333_3333, 0x4444_4444];
pub const RCA_RESPONSE: u32 = 0x1234_0500;
pub const SCR_WORDS: [u32; 2] = [0x0080_3502, 0];

/// Forced answer to a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Complete with these response registers
    Respond([u32; 4]),
    /// No status bit at all
    Timeout,
    /// Command timeout error
    CmdTimeout,
    /// Raw error bits
    Error(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Logged {
    pub command: Command,
    pub argument: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

#[derive(Debug)]
struct Script {
    command: Command,
    reply: Reply,
    remaining: Option<usize>,
}

/// Register-level card model
#[derive(Debug)]
pub struct SimCard {
    regs: RefCell<[u32; 64]>,
    interrupt: Cell<u32>,
    pub inserted: Cell<bool>,
    pub sdhc: Cell<bool>,
    pub accept_18v: Cell<bool>,
    pub dat_stuck: Cell<bool>,
    pub select_state: Cell<u32>,
    pub acmd41_busy: Cell<u32>,
    pub tie_break: Cell<bool>,
    pub accesses: Cell<usize>,
    pub data_resets: Cell<usize>,
    pub log: RefCell<Vec<Logged>>,
    pub written: RefCell<Vec<u32>>,
    state: Cell<u32>,
    app_pending: Cell<bool>,
    script: RefCell<Vec<Script>>,
    rx: RefCell<VecDeque<u32>>,
    transfer: Cell<Option<(Direction, u32, u32)>>,
}

impl SimCard {
    pub fn new() -> Self {
        let sim = Self {
            regs: RefCell::new([0; 64]),
            interrupt: Cell::new(0),
            inserted: Cell::new(true),
            sdhc: Cell::new(true),
            accept_18v: Cell::new(false),
            dat_stuck: Cell::new(false),
            select_state: Cell::new(3),
            acmd41_busy: Cell::new(0),
            tie_break: Cell::new(false),
            accesses: Cell::new(0),
            data_resets: Cell::new(0),
            log: RefCell::new(Vec::new()),
            written: RefCell::new(Vec::new()),
            state: Cell::new(0),
            app_pending: Cell::new(false),
            script: RefCell::new(Vec::new()),
            rx: RefCell::new(VecDeque::new()),
            transfer: Cell::new(None),
        };
        sim.regs.borrow_mut()[regs::SLOTISR_VER / 4] = 0x9902_0000;
        sim
    }

    /// Answer `command` with `reply` the next `times` times
    pub fn script(&self, command: Command, reply: Reply, times: usize) {
        self.script.borrow_mut().push(Script {
            command,
            reply,
            remaining: Some(times),
        });
    }

    /// Answer `command` with `reply` from now on
    pub fn always(&self, command: Command, reply: Reply) {
        self.script.borrow_mut().push(Script {
            command,
            reply,
            remaining: None,
        });
    }

    pub fn remove_card(&self) {
        self.inserted.set(false);
        self.raise(Interrupt::CARD_REMOVAL.bits());
    }

    pub fn insert_card(&self) {
        self.inserted.set(true);
        self.state.set(0);
    }

    /// Move the card to `state` behind the driver's back
    pub fn set_state(&self, state: u32) {
        self.state.set(state);
    }

    pub fn reg(&self, offset: usize) -> u32 {
        self.regs.borrow()[offset / 4]
    }

    pub fn count(&self, command: Command) -> usize {
        self.log.borrow().iter().filter(|l| l.command == command).count()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.log.borrow().iter().map(|l| l.command).collect()
    }

    pub fn clear_log(&self) {
        self.log.borrow_mut().clear();
        self.accesses.set(0);
    }

    /// Data word `word` of block `block` of a read starting at `argument`
    pub fn pattern(argument: u32, block: u32, word: u32) -> u32 {
        (argument.wrapping_add(block) << 16) | word
    }

    fn raise(&self, bits: u32) {
        self.interrupt.set(self.interrupt.get() | bits);
    }

    fn block_words(&self) -> u32 {
        (self.reg(regs::BLKSIZECNT) & 0x3FF) / 4
    }

    fn scripted(&self, command: Command) -> Option<Reply> {
        let mut script = self.script.borrow_mut();
        let entry = script
            .iter_mut()
            .find(|s| s.command == command && s.remaining != Some(0))?;
        if let Some(n) = entry.remaining.as_mut() {
            *n -= 1;
        }
        Some(entry.reply)
    }

    fn respond(&self, command: Command, response: [u32; 4]) {
        {
            let mut file = self.regs.borrow_mut();
            for (i, word) in response.iter().enumerate() {
                file[regs::RESP0 / 4 + i] = *word;
            }
        }
        let mut bits = Interrupt::CMD_DONE.bits();
        let word = command.word();
        if word.waits_for_transfer() && !word.has_data() {
            bits |= Interrupt::DATA_DONE.bits();
        }
        self.raise(bits);
    }

    fn start_transfer(&self, direction: Direction, words: &[u32]) {
        let blocks = (self.reg(regs::BLKSIZECNT) >> 16).max(1);
        self.rx.borrow_mut().extend(words.iter().copied());
        self.transfer.set(Some((direction, blocks, self.block_words())));
        let ready = match direction {
            Direction::Read => Interrupt::READ_RDY,
            Direction::Write => Interrupt::WRITE_RDY,
        };
        self.raise(ready.bits());
    }

    fn advance_transfer(&self) {
        let Some((direction, blocks, left)) = self.transfer.get() else {
            return;
        };
        if left > 1 {
            self.transfer.set(Some((direction, blocks, left - 1)));
            return;
        }
        if blocks > 1 {
            self.transfer.set(Some((direction, blocks - 1, self.block_words())));
            let ready = match direction {
                Direction::Read => Interrupt::READ_RDY,
                Direction::Write => Interrupt::WRITE_RDY,
            };
            self.raise(ready.bits());
            return;
        }
        self.transfer.set(None);
        let mut bits = Interrupt::DATA_DONE.bits();
        if self.tie_break.get() {
            bits |= Interrupt::DTO_ERR.bits();
        }
        self.raise(bits);
    }

    fn execute(&self, cmdtm: u32) {
        let index = cmdtm >> 24;
        let command = if self.app_pending.replace(false) {
            Command::app(index)
        } else {
            Command::sd(index)
        };
        let argument = self.reg(regs::ARG1);
        self.log.borrow_mut().push(Logged { command, argument });

        if let Some(reply) = self.scripted(command) {
            match reply {
                Reply::Respond(response) => {
                    if command == Command::APP_CMD {
                        self.app_pending.set(true);
                    }
                    self.respond(command, response)
                }
                Reply::Timeout => {}
                Reply::CmdTimeout => self.raise(Interrupt::CTO_ERR.bits()),
                Reply::Error(bits) => self.raise(bits),
            }
            return;
        }

        let state = self.state.get();
        let r1 = |state: u32| [(state << 9) | 0x100, 0, 0, 0];
        match (command.is_app(), index) {
            (false, 0) => {
                self.state.set(0);
                self.respond(command, [0; 4]);
            }
            (false, 2) => {
                self.state.set(2);
                self.respond(command, CID);
            }
            (false, 3) => {
                self.state.set(3);
                self.respond(command, [RCA_RESPONSE, 0, 0, 0]);
            }
            // SDIO probe goes unanswered
            (false, 5) => {}
            (false, 7) => {
                self.state.set(4);
                self.respond(command, r1(self.select_state.get()));
            }
            (false, 8) => self.respond(command, [argument & 0xFFF, 0, 0, 0]),
            (false, 12) => {
                self.state.set(4);
                self.respond(command, r1(state));
            }
            (false, 13) => self.respond(command, r1(state)),
            (false, 17) | (false, 18) => {
                self.respond(command, r1(state));
                let blocks = (self.reg(regs::BLKSIZECNT) >> 16).max(1);
                let words: Vec<u32> = (0..blocks)
                    .flat_map(|b| (0..self.block_words()).map(move |w| (b, w)))
                    .map(|(b, w)| Self::pattern(argument, b, w))
                    .collect();
                self.start_transfer(Direction::Read, &words);
            }
            (false, 24) | (false, 25) => {
                self.respond(command, r1(state));
                self.start_transfer(Direction::Write, &[]);
            }
            (false, 55) => {
                self.app_pending.set(true);
                self.respond(command, [(state << 9) | 0x120, 0, 0, 0]);
            }
            (true, 41) => {
                let mut response = ocr::VOLTAGE_WINDOW;
                if argument != 0 {
                    if self.acmd41_busy.get() > 0 {
                        self.acmd41_busy.set(self.acmd41_busy.get() - 1);
                    } else {
                        response |= ocr::READY;
                        if self.sdhc.get() && argument & ocr::HCS != 0 {
                            response |= ocr::HCS;
                        }
                        if self.accept_18v.get() && argument & ocr::S18A != 0 {
                            response |= ocr::S18A;
                        }
                        self.state.set(1);
                    }
                }
                self.respond(command, [response, 0, 0, 0]);
            }
            (true, 51) => {
                self.respond(command, r1(state));
                self.start_transfer(Direction::Read, &SCR_WORDS);
            }
            _ => self.respond(command, r1(state)),
        }
    }
}

impl RegisterBus for SimCard {
    fn read32(&self, offset: usize) -> u32 {
        self.accesses.set(self.accesses.get() + 1);
        match offset {
            regs::INTERRUPT => {
                let irpts = self.interrupt.get();
                if irpts & Interrupt::ERROR_MASK != 0 {
                    irpts | Interrupt::ERR.bits()
                } else {
                    irpts
                }
            }
            regs::STATUS => {
                let mut value = 0;
                if self.inserted.get() {
                    value |= status::CARD_INSERTED;
                }
                let clocked = self.reg(regs::CONTROL1) & Control1::CLK_EN.bits() != 0;
                if clocked || self.dat_stuck.get() {
                    value |= status::DAT_LEVEL;
                }
                value
            }
            regs::DATA => {
                let word = self.rx.borrow_mut().pop_front().unwrap_or(0);
                self.advance_transfer();
                word
            }
            _ => self.reg(offset),
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        self.accesses.set(self.accesses.get() + 1);
        match offset {
            regs::INTERRUPT => self.interrupt.set(self.interrupt.get() & !value),
            regs::CONTROL1 => {
                let reset_all = value & Control1::SRST_HC.bits() != 0;
                if value & Control1::SRST_DATA.bits() != 0 {
                    self.data_resets.set(self.data_resets.get() + 1);
                }
                let mut value = value & !Control1::RESET_ALL;
                if value & Control1::CLK_INTLEN.bits() != 0 {
                    value |= Control1::CLK_STABLE.bits();
                }
                let mut file = self.regs.borrow_mut();
                if reset_all {
                    value = 0;
                    file[regs::CONTROL0 / 4] = 0;
                    file[regs::CONTROL2 / 4] = 0;
                    self.interrupt.set(0);
                }
                file[offset / 4] = value;
            }
            regs::CMDTM => {
                self.regs.borrow_mut()[offset / 4] = value;
                self.execute(value);
            }
            regs::DATA => {
                self.written.borrow_mut().push(value);
                self.advance_transfer();
            }
            _ => self.regs.borrow_mut()[offset / 4] = value,
        }
    }
}

/// Firmware stand-in for power and clock requests
#[derive(Debug)]
pub struct StubFirmware {
    pub base_clock: Option<u32>,
    pub power_ok: bool,
}

impl Default for StubFirmware {
    fn default() -> Self {
        Self {
            base_clock: Some(250_000_000),
            power_ok: true,
        }
    }
}

impl PropertyChannel for StubFirmware {
    fn clock_rate(&mut self, clock: ClockId) -> Result<u32, MailboxError> {
        assert_eq!(clock, ClockId::Emmc);
        self.base_clock.ok_or(MailboxError::EmptyResponse)
    }

    fn set_power_state(&mut self, device: DeviceId, request: PowerRequest) -> Result<PowerStatus, MailboxError> {
        assert_eq!(device, DeviceId::SdCard);
        assert!(request.contains(PowerRequest::ON));
        if self.power_ok {
            Ok(PowerStatus::ON)
        } else {
            Ok(PowerStatus::NO_DEVICE)
        }
    }
}

pub type SimEmmc<'a> = Emmc<&'a SimCard, VirtualClock, StubFirmware>;

pub fn driver(sim: &SimCard, config: EmmcConfig) -> SimEmmc<'_> {
    Emmc::new(sim, VirtualClock::default(), StubFirmware::default(), config)
}

/// Driver with a card already enumerated and the log cleared
pub fn ready(sim: &SimCard, config: EmmcConfig) -> SimEmmc<'_> {
    let mut emmc = driver(sim, config);
    emmc.init().expect("card init");
    sim.clear_log();
    emmc
}

pub fn signal_1v8(sim: &SimCard) -> bool {
    sim.reg(regs::CONTROL0) & Control0::SIGNAL_1V8.bits() != 0
}
