//! # VideoCore Mailbox
//!
//! The ARM talks to the VideoCore firmware through a pair of hardware
//! FIFOs. A 32-bit message carries a 28-bit payload in its upper bits and a
//! channel number in the low nibble.
//!
//! On the property-tag channel the payload is the bus address of a request
//! buffer:
//!
//! ```text
//! +------------+------------+-------------------+-----+---------+
//! | total size | code       | tag ... tag       | 0   | padding |
//! +------------+------------+-------------------+-----+---------+
//!   tag = id | value buffer size | request/response length | value words
//! ```
//!
//! The firmware answers by echoing the same address once it has rewritten
//! the buffer in place.

pub mod tags;

use bitflags::bitflags;
use core::fmt;
use stos_hal::cpu::CacheMaintenance;
use stos_hal::mmio::RegisterBus;
use stos_hal::PhysAddr;

pub use tags::{ClockId, DeviceId, PowerRequest, PowerStatus, Tag, TagHeader, TagWords, RESPONSE_BIT};
use tags::tag_id;

/// Mailbox register offsets
pub mod regs {
    /// Mailbox 0 read (VC to ARM)
    pub const READ: usize = 0x00;
    /// Mailbox 0 status
    pub const STATUS0: usize = 0x18;
    /// Mailbox 1 write (ARM to VC)
    pub const WRITE: usize = 0x20;
    /// Mailbox 1 status
    pub const STATUS1: usize = 0x38;
}

bitflags! {
    /// Mailbox status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MailboxStatus: u32 {
        /// Nothing to read
        const EMPTY = 1 << 30;
        /// No room to write
        const FULL = 1 << 31;
    }
}

/// Mailbox channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    /// Property tags, ARM to VideoCore
    PropertyTags = 8,
}

/// Request code of an outgoing buffer
pub const CODE_REQUEST: u32 = 0x0000_0000;
/// Response code: request processed
pub const CODE_RESPONSE_SUCCESS: u32 = 0x8000_0000;
/// Response code: error parsing the request
pub const CODE_RESPONSE_FAILURE: u32 = 0x8000_0001;

/// Scratch buffer size in 32-bit words
const BUFFER_WORDS: usize = 1024;

/// Size and code words in front of the tags
const HEADER_WORDS: usize = 2;

/// Property buffer shared with the firmware
#[repr(C, align(16))]
struct PropertyBuffer {
    words: [u32; BUFFER_WORDS],
}

static_assertions::const_assert_eq!(core::mem::size_of::<PropertyBuffer>(), 4096);
static_assertions::const_assert_eq!(core::mem::align_of::<PropertyBuffer>(), 16);

/// Mailbox failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxError {
    /// The firmware answered with a different buffer address
    AddressMismatch {
        /// Payload that was sent
        sent: u32,
        /// Payload that came back
        received: u32,
    },
    /// The buffer code is not [`CODE_RESPONSE_SUCCESS`]
    BadResponseStatus(u32),
    /// The tag was not marked as a response
    NotAResponse,
    /// The tag response is empty
    EmptyResponse,
    /// The tags do not fit into the scratch buffer
    TooLarge,
}

impl fmt::Display for MailboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailboxError::AddressMismatch { sent, received } => {
                write!(f, "mailbox echoed {:#x}, expected {:#x}", received, sent)
            }
            MailboxError::BadResponseStatus(code) => write!(f, "property request failed: {:#x}", code),
            MailboxError::NotAResponse => write!(f, "tag not processed by firmware"),
            MailboxError::EmptyResponse => write!(f, "empty tag response"),
            MailboxError::TooLarge => write!(f, "property request too large"),
        }
    }
}

/// Firmware services other drivers depend on
pub trait PropertyChannel {
    /// Current rate of `clock` in Hz
    fn clock_rate(&mut self, clock: ClockId) -> Result<u32, MailboxError>;

    /// Switch the power domain of `device`
    fn set_power_state(&mut self, device: DeviceId, request: PowerRequest) -> Result<PowerStatus, MailboxError>;
}

/// ARM and VideoCore memory split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// ARM memory base
    pub arm_base: u32,
    /// ARM memory size in bytes
    pub arm_size: u32,
    /// VideoCore memory base
    pub vc_base: u32,
    /// VideoCore memory size in bytes
    pub vc_size: u32,
}

impl MemoryLayout {
    /// First address past ARM memory
    pub const fn arm_top(&self) -> u32 {
        self.arm_base.wrapping_add(self.arm_size)
    }
}

/// The mailbox and its property-tag scratch buffer
///
/// Not reentrant: every transaction rewrites the single scratch buffer.
pub struct Mailbox<B, C> {
    bus: B,
    cpu: C,
    gpu_mem_base: u32,
    buffer: PropertyBuffer,
}

impl<B: RegisterBus, C: CacheMaintenance> Mailbox<B, C> {
    /// Create a mailbox; `gpu_mem_base` is the bus alias of ARM memory
    pub const fn new(bus: B, cpu: C, gpu_mem_base: u32) -> Self {
        Self {
            bus,
            cpu,
            gpu_mem_base,
            buffer: PropertyBuffer {
                words: [0; BUFFER_WORDS],
            },
        }
    }

    /// The register block
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Post `data` (28 bits) on `channel`
    pub fn write(&self, channel: Channel, data: u32) {
        while MailboxStatus::from_bits_truncate(self.bus.read32(regs::STATUS1)).contains(MailboxStatus::FULL) {
            core::hint::spin_loop();
        }
        self.bus.write32(regs::WRITE, (data << 4) | (channel as u32 & 0xF));
    }

    /// Wait for a message on `channel` and return its payload
    ///
    /// Messages for other channels are discarded. There is no timeout: the
    /// firmware always answers unless the SoC is wedged.
    pub fn read(&self, channel: Channel) -> u32 {
        loop {
            while MailboxStatus::from_bits_truncate(self.bus.read32(regs::STATUS0)).contains(MailboxStatus::EMPTY) {
                core::hint::spin_loop();
            }
            let message = self.bus.read32(regs::READ);
            if message & 0xF == channel as u32 {
                return message >> 4;
            }
            log::trace!("mbox: dropping {:#010x} while waiting on {:?}", message, channel);
        }
    }

    /// Run a property transaction over `tags`
    ///
    /// `tags` holds one or more complete tags without the end marker. On
    /// success it is overwritten with the firmware's answer; on failure it
    /// is left untouched.
    pub fn get_tags(&mut self, tags: &mut [u32]) -> Result<(), MailboxError> {
        let total_words = HEADER_WORDS + tags.len() + 1;
        if total_words > BUFFER_WORDS {
            return Err(MailboxError::TooLarge);
        }
        let total_bytes = total_words * 4;

        {
            let words = &mut self.buffer.words;
            words[0] = total_bytes as u32;
            words[1] = CODE_REQUEST;
            words[HEADER_WORDS..HEADER_WORDS + tags.len()].copy_from_slice(tags);
            words[HEADER_WORDS + tags.len()] = tag_id::END;
        }

        let base = self.buffer.words.as_ptr();
        let phys = PhysAddr::of(base);
        self.cpu.clean_dcache_range(base as usize, total_bytes);
        self.cpu.data_sync_barrier();

        let sent = phys.to_bus(self.gpu_mem_base).as_u32() >> 4;
        self.write(Channel::PropertyTags, sent);
        let received = self.read(Channel::PropertyTags);
        if received != sent {
            log::error!("mbox: sent {:#x}, got {:#x}", sent, received);
            return Err(MailboxError::AddressMismatch { sent, received });
        }

        self.cpu.invalidate_dcache_range(base as usize, total_bytes);
        self.cpu.data_memory_barrier();

        // The firmware rewrote the buffer behind the compiler's back
        // SAFETY: index 1 is within the buffer
        let code = unsafe { core::ptr::read_volatile(base.add(1)) };
        if code != CODE_RESPONSE_SUCCESS {
            log::warn!("mbox: property request failed with {:#x}", code);
            return Err(MailboxError::BadResponseStatus(code));
        }

        for (i, word) in tags.iter_mut().enumerate() {
            // SAFETY: HEADER_WORDS + i < total_words <= BUFFER_WORDS
            *word = unsafe { core::ptr::read_volatile(base.add(HEADER_WORDS + i)) };
        }
        Ok(())
    }

    /// Run a single-tag transaction
    ///
    /// `request_len` is the number of request bytes in the value buffer.
    /// Succeeds only if the firmware marked the tag as answered with a
    /// non-empty response; the response bit is cleared on return.
    pub fn get_tag<const N: usize>(&mut self, id: u32, tag: &mut Tag<N>, request_len: u32) -> Result<(), MailboxError> {
        tag.prepare(id, request_len);
        self.get_tags(tag.as_words_mut())?;
        check_response(&mut tag.header)
    }

    fn query<const N: usize>(&mut self, id: u32, value: [u32; N], request_len: u32) -> Result<[u32; N], MailboxError> {
        let mut tag = Tag::new(value);
        self.get_tag(id, &mut tag, request_len)?;
        Ok(tag.value)
    }

    /// VideoCore firmware revision
    pub fn firmware_revision(&mut self) -> Result<u32, MailboxError> {
        Ok(self.query(tag_id::GET_FIRMWARE_REVISION, [0], 0)?[0])
    }

    /// Board model
    pub fn board_model(&mut self) -> Result<u32, MailboxError> {
        Ok(self.query(tag_id::GET_BOARD_MODEL, [0], 0)?[0])
    }

    /// Board revision code
    pub fn board_revision(&mut self) -> Result<u32, MailboxError> {
        Ok(self.query(tag_id::GET_BOARD_REVISION, [0], 0)?[0])
    }

    /// Board serial number
    pub fn board_serial(&mut self) -> Result<u64, MailboxError> {
        let [lo, hi] = self.query(tag_id::GET_BOARD_SERIAL, [0, 0], 0)?;
        Ok((u64::from(hi) << 32) | u64::from(lo))
    }

    /// Ethernet MAC address
    pub fn mac_address(&mut self) -> Result<[u8; 6], MailboxError> {
        let [lo, hi] = self.query(tag_id::GET_MAC_ADDRESS, [0, 0], 0)?;
        let (lo, hi) = (lo.to_le_bytes(), hi.to_le_bytes());
        Ok([lo[0], lo[1], lo[2], lo[3], hi[0], hi[1]])
    }

    /// ARM and VideoCore memory split, fetched in one transaction
    pub fn memory_layout(&mut self) -> Result<MemoryLayout, MailboxError> {
        let mut tags = [Tag::<2>::default(), Tag::<2>::default()];
        tags[0].prepare(tag_id::GET_ARM_MEMORY, 8);
        tags[1].prepare(tag_id::GET_VC_MEMORY, 8);
        self.get_tags(tags.as_words_mut())?;
        for tag in &mut tags {
            check_response(&mut tag.header)?;
        }
        Ok(MemoryLayout {
            arm_base: tags[0].value[0],
            arm_size: tags[0].value[1],
            vc_base: tags[1].value[0],
            vc_size: tags[1].value[1],
        })
    }

    /// Maximum rate of `clock` in Hz
    pub fn max_clock_rate(&mut self, clock: ClockId) -> Result<u32, MailboxError> {
        Ok(self.query(tag_id::GET_MAX_CLOCK_RATE, [clock as u32, 0], 4)?[1])
    }

    /// SoC temperature in thousandths of a degree Celsius
    pub fn temperature(&mut self) -> Result<u32, MailboxError> {
        Ok(self.query(tag_id::GET_TEMPERATURE, [0, 0], 4)?[1])
    }
}

impl<B: RegisterBus, C: CacheMaintenance> PropertyChannel for Mailbox<B, C> {
    fn clock_rate(&mut self, clock: ClockId) -> Result<u32, MailboxError> {
        Ok(self.query(tag_id::GET_CLOCK_RATE, [clock as u32, 0], 4)?[1])
    }

    fn set_power_state(&mut self, device: DeviceId, request: PowerRequest) -> Result<PowerStatus, MailboxError> {
        let [_, state] = self.query(tag_id::SET_POWER_STATE, [device as u32, request.bits()], 8)?;
        Ok(PowerStatus::from_bits_truncate(state))
    }
}

impl<B: fmt::Debug, C: fmt::Debug> fmt::Debug for Mailbox<B, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("bus", &self.bus)
            .field("cpu", &self.cpu)
            .field("gpu_mem_base", &format_args!("{:#x}", self.gpu_mem_base))
            .finish_non_exhaustive()
    }
}

fn check_response(header: &mut TagHeader) -> Result<(), MailboxError> {
    if header.value_length & RESPONSE_BIT == 0 {
        return Err(MailboxError::NotAResponse);
    }
    header.value_length &= !RESPONSE_BIT;
    if header.value_length == 0 {
        return Err(MailboxError::EmptyResponse);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingCpu;
    use core::cell::{Cell, RefCell};

    /// Mailbox registers plus a firmware model that answers property requests
    #[derive(Debug, Default)]
    struct FirmwareMock {
        buffer: Cell<Option<*mut u32>>,
        posted: RefCell<Vec<u32>>,
        pending: RefCell<Vec<u32>>,
        corrupt_echo: Cell<bool>,
        fail_code: Cell<bool>,
        ignore_tags: Cell<bool>,
        foreign_first: Cell<bool>,
    }

    impl FirmwareMock {
        fn answer(&self, tag: u32, request: &[u32]) -> Vec<u32> {
            match tag {
                tag_id::GET_BOARD_REVISION => vec![0x00a0_2082],
                tag_id::GET_FIRMWARE_REVISION => vec![0x5e2_a1b0],
                tag_id::GET_CLOCK_RATE => vec![request[0], 250_000_000],
                tag_id::GET_MAX_CLOCK_RATE => vec![request[0], 1_200_000_000],
                tag_id::GET_ARM_MEMORY => vec![0, 0x3b00_0000],
                tag_id::GET_VC_MEMORY => vec![0x3b00_0000, 0x0500_0000],
                tag_id::SET_POWER_STATE => vec![request[0], request[1] & 1],
                tag_id::GET_MAC_ADDRESS => vec![0x5544_3322, 0x0000_7766],
                _ => vec![],
            }
        }

        /// Rewrite the request buffer the way the firmware does
        fn process(&self) {
            let Some(base) = self.buffer.get() else { return };
            // SAFETY: the test attached the mailbox's own scratch buffer
            unsafe {
                if self.fail_code.get() {
                    *base.add(1) = CODE_RESPONSE_FAILURE;
                    return;
                }
                *base.add(1) = CODE_RESPONSE_SUCCESS;
                let mut at = HEADER_WORDS;
                loop {
                    let id = *base.add(at);
                    if id == tag_id::END {
                        break;
                    }
                    let size = *base.add(at + 1) as usize / 4;
                    if !self.ignore_tags.get() {
                        let request: Vec<u32> = (0..size).map(|i| *base.add(at + 3 + i)).collect();
                        let answer = self.answer(id, &request);
                        for (i, word) in answer.iter().enumerate().take(size) {
                            *base.add(at + 3 + i) = *word;
                        }
                        *base.add(at + 2) = RESPONSE_BIT | (answer.len() * 4) as u32;
                    }
                    at += 3 + size;
                }
            }
        }
    }

    impl RegisterBus for FirmwareMock {
        fn read32(&self, offset: usize) -> u32 {
            match offset {
                regs::STATUS0 if self.pending.borrow().is_empty() => MailboxStatus::EMPTY.bits(),
                regs::READ => self.pending.borrow_mut().remove(0),
                _ => 0,
            }
        }

        fn write32(&self, offset: usize, value: u32) {
            assert_eq!(offset, regs::WRITE);
            self.posted.borrow_mut().push(value);
            self.process();
            if self.foreign_first.get() {
                self.pending.borrow_mut().push(0xABCD_0001);
            }
            let echo = if self.corrupt_echo.get() { value ^ 0x100 } else { value };
            self.pending.borrow_mut().push(echo);
        }
    }

    fn mailbox() -> Box<Mailbox<FirmwareMock, RecordingCpu>> {
        let mut mbox = Box::new(Mailbox::new(FirmwareMock::default(), RecordingCpu::default(), 0xC000_0000));
        let base = mbox.buffer.words.as_mut_ptr();
        mbox.bus.buffer.set(Some(base));
        mbox
    }

    #[test]
    fn test_message_encoding() {
        let mbox = mailbox();
        mbox.bus.buffer.set(None);
        mbox.write(Channel::PropertyTags, 0x0123_4567);
        assert_eq!(mbox.bus.posted.borrow()[0], 0x1234_5678);
        assert_eq!(mbox.read(Channel::PropertyTags), 0x0123_4567);
    }

    #[test]
    fn test_read_skips_other_channels() {
        let mbox = mailbox();
        mbox.bus.buffer.set(None);
        mbox.bus.foreign_first.set(true);
        mbox.write(Channel::PropertyTags, 0x10);
        assert_eq!(mbox.read(Channel::PropertyTags), 0x10);
        assert!(mbox.bus.pending.borrow().is_empty());
    }

    #[test]
    fn test_get_tag_round_trip() {
        let mut mbox = mailbox();
        let mut tag = Tag::new([ClockId::Emmc as u32, 0]);
        mbox.get_tag(tag_id::GET_CLOCK_RATE, &mut tag, 4).unwrap();
        assert_eq!(tag.value, [1, 250_000_000]);
        assert_eq!(tag.header.value_length, 8);
        assert_eq!(tag.header.value_buf_size, 8);
    }

    #[test]
    fn test_barriers_bracket_exchange() {
        let mut mbox = mailbox();
        mbox.board_revision().unwrap();
        let log = mbox.cpu.log.borrow();
        assert_eq!(*log, vec!["clean", "dsb", "invalidate", "dmb"]);
    }

    #[test]
    fn test_wrong_echo_fails_and_keeps_caller_tag() {
        let mut mbox = mailbox();
        mbox.bus.corrupt_echo.set(true);
        let mut tag = Tag::new([ClockId::Emmc as u32, 0]);
        let result = mbox.get_tag(tag_id::GET_CLOCK_RATE, &mut tag, 4);
        assert!(matches!(result, Err(MailboxError::AddressMismatch { .. })));
        // only the header written before the exchange changed
        assert_eq!(tag.header.tag_id, tag_id::GET_CLOCK_RATE);
        assert_eq!(tag.header.value_length, 4);
        assert_eq!(tag.value, [1, 0]);
    }

    #[test]
    fn test_failure_code() {
        let mut mbox = mailbox();
        mbox.bus.fail_code.set(true);
        assert_eq!(mbox.board_revision(), Err(MailboxError::BadResponseStatus(CODE_RESPONSE_FAILURE)));
    }

    #[test]
    fn test_unanswered_tag() {
        let mut mbox = mailbox();
        mbox.bus.ignore_tags.set(true);
        assert_eq!(mbox.board_revision(), Err(MailboxError::NotAResponse));
    }

    #[test]
    fn test_empty_answer() {
        let mut mbox = mailbox();
        assert_eq!(mbox.temperature(), Err(MailboxError::EmptyResponse));
    }

    #[test]
    fn test_request_header_and_end_tag() {
        let mut mbox = mailbox();
        mbox.board_revision().unwrap();
        let words = &mbox.buffer.words;
        assert_eq!(words[0], 4 * (2 + 4 + 1));
        assert_eq!(words[2], tag_id::GET_BOARD_REVISION);
        assert_eq!(words[6], tag_id::END);
    }

    #[test]
    fn test_too_large() {
        let mut mbox = mailbox();
        let mut huge = vec![0u32; BUFFER_WORDS];
        assert_eq!(mbox.get_tags(&mut huge), Err(MailboxError::TooLarge));
        assert!(mbox.bus.posted.borrow().is_empty());
    }

    #[test]
    fn test_typed_queries() {
        let mut mbox = mailbox();
        assert_eq!(mbox.board_revision(), Ok(0x00a0_2082));
        assert_eq!(mbox.clock_rate(ClockId::Emmc), Ok(250_000_000));
        assert_eq!(mbox.max_clock_rate(ClockId::Arm), Ok(1_200_000_000));
        assert_eq!(mbox.mac_address(), Ok([0x22, 0x33, 0x44, 0x55, 0x66, 0x77]));
        let layout = mbox.memory_layout().unwrap();
        assert_eq!(layout.arm_top(), 0x3b00_0000);
        assert_eq!(layout.vc_size, 0x0500_0000);
        let status = mbox
            .set_power_state(DeviceId::SdCard, PowerRequest::ON | PowerRequest::WAIT)
            .unwrap();
        assert_eq!(status, PowerStatus::ON);
    }
}
