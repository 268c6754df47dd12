//! Board bring-up and the peripheral singletons
//!
//! Every peripheral driver is an owned value; the board puts each one
//! behind its own `spin::Mutex` so the IRQ path and the block-device hooks
//! never contend for unrelated hardware. A lock the IRQ path also takes is
//! only held from thread code with IRQs masked. The input rings take no
//! lock at all. The mailbox lives in a separate static because the SD
//! driver borrows it for clock and power requests.

use crate::platform::Platform;
use core::fmt;
use spin::{Mutex, Once};
use stos_hal::arch::bcm2835::intc::lines;
use stos_hal::arch::bcm2835::{offsets, Bcm2835Intc, SystemTimer, LOCAL_LAYOUT};
use stos_hal::cpu::{without_interrupts, ArmCpu};
use stos_hal::interrupts::{IrqDispatcher, IrqHandler, IrqLine};
use stos_hal::mmio::Mmio;
use stos_hal::timer::SystemTick;
use stos_hal::HalError;
use stos_io::emmc::{BiosError, BlockIo, Emmc, IoctlRequest, IoctlResponse, SdError, E_OK};
use stos_io::ikbd::{Ikbd, IkbdVectors, InputBuffers};
use stos_io::mailbox::{ClockId, DeviceId, Mailbox, MailboxError, PowerRequest, PowerStatus, PropertyChannel};

/// Size of the interrupt handler table
pub const IRQ_LINES: usize = 84;

static_assertions::const_assert!(LOCAL_LAYOUT.line_count() <= IRQ_LINES);

/// The firmware mailbox as wired on this board
pub type BoardMailbox = Mailbox<Mmio, ArmCpu>;
type BoardIrq = IrqDispatcher<'static, Bcm2835Intc<Mmio>, IRQ_LINES>;

/// The SD driver as wired on this board
pub type BoardSd = Emmc<Mmio, SystemTimer<Mmio>, SharedMailbox>;

static MAILBOX: Once<Mutex<BoardMailbox>> = Once::new();
static BOARD: Once<Board> = Once::new();
static SUB_TICK: Once<fn()> = Once::new();
static TIMER_TICK: TimerTick = TimerTick;

/// Bring-up failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardError {
    /// Interrupt or timer setup failed
    Hal(HalError),
    /// [`init`] already ran
    AlreadyInitialized,
}

impl From<HalError> for BoardError {
    fn from(err: HalError) -> Self {
        BoardError::Hal(err)
    }
}

impl fmt::Display for BoardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardError::Hal(err) => write!(f, "board bring-up failed: {}", err),
            BoardError::AlreadyInitialized => write!(f, "board already initialized"),
        }
    }
}

/// Property channel handed to drivers that need the firmware
#[derive(Debug, Clone, Copy)]
pub struct SharedMailbox(&'static Mutex<BoardMailbox>);

impl PropertyChannel for SharedMailbox {
    fn clock_rate(&mut self, clock: ClockId) -> Result<u32, MailboxError> {
        self.0.lock().clock_rate(clock)
    }

    fn set_power_state(&mut self, device: DeviceId, request: PowerRequest) -> Result<PowerStatus, MailboxError> {
        self.0.lock().set_power_state(device, request)
    }
}

/// The composed board
#[derive(Debug)]
pub struct Board {
    platform: Platform,
    mailbox: &'static Mutex<BoardMailbox>,
    irq: Mutex<BoardIrq>,
    timer: Mutex<SystemTimer<Mmio>>,
    tick: SystemTick,
    sd: Mutex<BoardSd>,
    ikbd: Mutex<Ikbd>,
    input: InputBuffers,
}

impl Board {
    /// Platform the board was brought up with
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// The firmware mailbox
    pub fn mailbox(&self) -> &'static Mutex<BoardMailbox> {
        self.mailbox
    }

    /// The SD card driver
    pub fn sd(&self) -> &Mutex<BoardSd> {
        &self.sd
    }

    /// Ticks since the timer was armed
    pub fn ticks(&self) -> u32 {
        self.tick.ticks()
    }

    /// Register `handler` for `line`; `None` disconnects it
    ///
    /// Must not be called from an interrupt handler.
    pub fn connect(&self, line: IrqLine, handler: Option<&'static dyn IrqHandler>) -> Result<(), BoardError> {
        without_interrupts(|| self.irq.lock().connect(line, handler))?;
        Ok(())
    }

    /// Feed a byte received from the keyboard processor
    pub fn ikbd_receive(&self, byte: u8) {
        without_interrupts(|| {
            let mut vectors = &self.input;
            self.ikbd.lock().receive(byte, &mut vectors);
        });
    }

    /// Queue a received MIDI byte
    pub fn midi_receive(&self, byte: u8) {
        (&self.input).midivec(byte);
    }

    /// Oldest queued key byte
    pub fn pop_key(&self) -> Option<u8> {
        self.input.keyboard.pop()
    }

    /// Oldest queued MIDI byte
    pub fn pop_midi(&self) -> Option<u8> {
        self.input.midi.pop()
    }

    fn timer_tick(&self) {
        service_tick(&self.tick, SUB_TICK.get().copied(), || self.timer.lock().acknowledge_tick());
    }

    fn log_firmware_info(&self) {
        let mut mailbox = self.mailbox.lock();
        match mailbox.board_revision() {
            Ok(revision) => log::info!("board: {} revision {:#x}", self.platform.name, revision),
            Err(err) => log::warn!("board: revision query failed: {}", err),
        }
        match mailbox.memory_layout() {
            Ok(layout) => log::info!(
                "board: ARM memory {:#010x}..{:#010x}, VC memory {:#010x} ({} KiB)",
                layout.arm_base,
                layout.arm_top(),
                layout.vc_base,
                layout.vc_size / 1024
            ),
            Err(err) => log::warn!("board: memory layout query failed: {}", err),
        }
        match (mailbox.clock_rate(ClockId::Arm), mailbox.max_clock_rate(ClockId::Arm)) {
            (Ok(rate), Ok(max)) => log::info!("board: ARM clock {} MHz (max {} MHz)", rate / 1_000_000, max / 1_000_000),
            (Err(err), _) | (_, Err(err)) => log::warn!("board: ARM clock query failed: {}", err),
        }
    }
}

struct TimerTick;

impl IrqHandler for TimerTick {
    fn handle(&self) {
        if let Some(board) = BOARD.get() {
            board.timer_tick();
        }
    }
}

fn peripheral(platform: &Platform, offset: usize) -> Mmio {
    // SAFETY: `init` requires that `platform` describes the running board
    // with its peripheral window mapped; `offset` names a block inside it
    unsafe { Mmio::new(platform.block(offset)) }
}

fn interrupt_controller(platform: &Platform) -> Bcm2835Intc<Mmio> {
    let basic = peripheral(platform, offsets::INTC);
    match platform.io_base.local_base() {
        // SAFETY: the core-local block is part of the same mapped window
        Some(local) => Bcm2835Intc::with_local(basic, unsafe { Mmio::new(local) }),
        None => Bcm2835Intc::new(basic),
    }
}

/// Bring the board up
///
/// Interrupt lines are masked, the system tick is armed and connected, the
/// firmware is asked for the board revision and memory split, and the SD
/// card is initialized. A card that fails to come up is logged and left for
/// the next block-device access to retry.
///
/// # Safety
/// `platform` must describe the board this code runs on, with its
/// peripheral window mapped at the physical addresses it names.
pub unsafe fn init(platform: Platform) -> Result<&'static Board, BoardError> {
    if BOARD.is_completed() {
        return Err(BoardError::AlreadyInitialized);
    }
    log::info!("board: bringing up {}", platform.name);

    let mailbox = MAILBOX.call_once(|| {
        Mutex::new(Mailbox::new(
            peripheral(&platform, offsets::MAILBOX),
            ArmCpu,
            platform.io_base.gpu_mem_base(),
        ))
    });

    let board = BOARD.call_once(|| Board {
        platform,
        mailbox,
        irq: Mutex::new(IrqDispatcher::new(interrupt_controller(&platform))),
        timer: Mutex::new(SystemTimer::new(peripheral(&platform, offsets::SYSTIMER))),
        tick: SystemTick::new(),
        sd: Mutex::new(Emmc::new(
            peripheral(&platform, offsets::EMMC),
            SystemTimer::new(peripheral(&platform, offsets::SYSTIMER)),
            SharedMailbox(mailbox),
            platform.emmc,
        )),
        ikbd: Mutex::new(Ikbd::new()),
        input: InputBuffers::new(),
    });

    without_interrupts(|| board.irq.lock().init());
    board.timer.lock().start_periodic(platform.tick.hz)?;
    board.connect(lines::TIMER3, Some(&TIMER_TICK))?;

    board.log_firmware_info();

    if let Err(err) = board.sd.lock().init() {
        log::error!("board: SD card not ready: {}", err);
    }
    Ok(board)
}

/// Advance the tick, run the 50 Hz hook when due, then acknowledge M3
fn service_tick(tick: &SystemTick, hook: Option<fn()>, acknowledge: impl FnOnce()) {
    if tick.tick() {
        if let Some(hook) = hook {
            hook();
        }
    }
    acknowledge();
}

/// The board, once [`init`] has run
pub fn board() -> Option<&'static Board> {
    BOARD.get()
}

/// Install the 50 Hz hook run from the timer tick; only the first call counts
pub fn set_sub_tick_handler(handler: fn()) {
    SUB_TICK.call_once(|| handler);
}

/// IRQ exception entry: service one pending line
///
/// Returns the line whose handler ran.
pub fn irq_entry() -> Option<IrqLine> {
    BOARD.get()?.irq.lock().dispatch()
}

/// Keyboard ACIA receive interrupt body
pub fn ikbd_receive(byte: u8) {
    if let Some(board) = BOARD.get() {
        board.ikbd_receive(byte);
    }
}

/// MIDI ACIA receive interrupt body
pub fn midi_receive(byte: u8) {
    if let Some(board) = BOARD.get() {
        board.midi_receive(byte);
    }
}

/// Block-device hook: (re)initialize the card
pub fn sd_init() -> i32 {
    let Some(board) = BOARD.get() else {
        return BiosError::UnknownDevice.code();
    };
    init_status(board.sd.lock().init())
}

/// Block-device hook: transfer `count` sectors starting at `sector`
pub fn sd_rw(write: bool, buf: &mut [u8], sector: u32, count: u16, device: u16) -> i32 {
    let Some(board) = BOARD.get() else {
        return BiosError::UnknownDevice.code();
    };
    let io = if write { BlockIo::Write(buf) } else { BlockIo::Read(buf) };
    status(board.sd.lock().read_write(io, sector, count, device))
}

/// Block-device hook: answer a control request, writing any result to `arg`
pub fn sd_ioctl(device: u16, request: u16, arg: &mut [u8]) -> i32 {
    let Some(board) = BOARD.get() else {
        return BiosError::UnknownDevice.code();
    };
    let response = board.sd.lock().ioctl(device, IoctlRequest::from_code(request));
    match response {
        Ok(response) => encode_ioctl(&response, arg),
        Err(err) => err.code(),
    }
}

/// Legacy status code of a block-device result
pub fn status(result: Result<(), BiosError>) -> i32 {
    match result {
        Ok(()) => E_OK,
        Err(err) => err.code(),
    }
}

fn init_status(result: Result<(), SdError>) -> i32 {
    match result {
        Ok(()) => E_OK,
        Err(err) => {
            log::error!("board: SD init failed: {}", err);
            err.code()
        }
    }
}

/// Serialize an ioctl answer into the caller's argument buffer
///
/// Disk info is two native-endian words (block count, block size), the disk
/// name is NUL terminated, and a media-change answer is the return value
/// itself.
pub fn encode_ioctl(response: &IoctlResponse, arg: &mut [u8]) -> i32 {
    match response {
        IoctlResponse::DiskInfo { blocks, block_size } => {
            let Some(out) = arg.get_mut(..8) else {
                return BiosError::Err.code();
            };
            out[..4].copy_from_slice(&blocks.to_ne_bytes());
            out[4..].copy_from_slice(&block_size.to_ne_bytes());
            E_OK
        }
        IoctlResponse::DiskName(name) => {
            let bytes = name.as_bytes();
            let Some(out) = arg.get_mut(..=bytes.len()) else {
                return BiosError::Err.code();
            };
            out[..bytes.len()].copy_from_slice(bytes);
            out[bytes.len()] = 0;
            E_OK
        }
        IoctlResponse::MediaChange(state) => *state as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stos_io::emmc::MediaState;

    #[test]
    fn test_disk_info_encoding() {
        let mut arg = [0xAAu8; 12];
        let response = IoctlResponse::DiskInfo {
            blocks: 31_250_000,
            block_size: 512,
        };
        assert_eq!(encode_ioctl(&response, &mut arg), E_OK);
        assert_eq!(arg[..4], 31_250_000u32.to_ne_bytes());
        assert_eq!(arg[4..8], 512u32.to_ne_bytes());
        assert_eq!(arg[8..], [0xAA; 4]);

        let mut short = [0u8; 7];
        assert_eq!(encode_ioctl(&response, &mut short), BiosError::Err.code());
    }

    #[test]
    fn test_disk_name_is_nul_terminated() {
        let mut name = heapless::String::<32>::new();
        name.push_str("0123456789abcdef0123456789abcdef").unwrap();
        let response = IoctlResponse::DiskName(name);

        let mut arg = [0xFFu8; 33];
        assert_eq!(encode_ioctl(&response, &mut arg), E_OK);
        assert_eq!(&arg[..32], b"0123456789abcdef0123456789abcdef");
        assert_eq!(arg[32], 0);

        let mut short = [0u8; 32];
        assert_eq!(encode_ioctl(&response, &mut short), BiosError::Err.code());
    }

    #[test]
    fn test_media_change_is_return_value() {
        let mut arg: [u8; 0] = [];
        assert_eq!(encode_ioctl(&IoctlResponse::MediaChange(MediaState::Unchanged), &mut arg), 0);
        assert_eq!(encode_ioctl(&IoctlResponse::MediaChange(MediaState::Changed), &mut arg), 2);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status(Ok(())), E_OK);
        assert_eq!(status(Err(BiosError::WriteProtected)), -13);
        assert_eq!(init_status(Err(SdError::NoCard)), SdError::NoCard.code());
    }

    #[test]
    fn test_hooks_before_init() {
        assert!(board().is_none());
        assert_eq!(irq_entry(), None);
        assert_eq!(sd_init(), BiosError::UnknownDevice.code());
        assert_eq!(sd_rw(false, &mut [0u8; 512], 0, 1, 0), BiosError::UnknownDevice.code());
        assert_eq!(sd_ioctl(0, 0, &mut [0u8; 8]), BiosError::UnknownDevice.code());
        ikbd_receive(0x1E);
        midi_receive(0x90);
    }

    static HOOK_CALLS: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

    fn count_hook() {
        HOOK_CALLS.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
    }

    #[test]
    fn test_sub_tick_hook_runs_before_acknowledge() {
        use core::sync::atomic::Ordering;

        let tick = SystemTick::new();
        for _ in 0..8 {
            let mut seen_at_ack = None;
            service_tick(&tick, Some(count_hook as fn()), || seen_at_ack = Some(HOOK_CALLS.load(Ordering::SeqCst)));
            assert_eq!(seen_at_ack, Some(HOOK_CALLS.load(Ordering::SeqCst)));
        }
        assert_eq!(tick.ticks(), 8);
        assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_board_error_display() {
        assert_eq!(BoardError::AlreadyInitialized.to_string(), "board already initialized");
        assert_eq!(BoardError::from(HalError::InvalidParameter), BoardError::Hal(HalError::InvalidParameter));
    }
}
