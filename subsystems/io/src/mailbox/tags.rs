//! Property tag records and identifiers

use bitflags::bitflags;
use core::mem::size_of;

/// Property tag identifiers
pub mod tag_id {
    /// End of the tag list
    pub const END: u32 = 0x0000_0000;

    // VideoCore
    /// Firmware revision
    pub const GET_FIRMWARE_REVISION: u32 = 0x0000_0001;
    /// Hardware cursor image
    pub const SET_CURSOR_INFO: u32 = 0x0000_8010;
    /// Hardware cursor position and visibility
    pub const SET_CURSOR_STATE: u32 = 0x0000_8011;

    // Hardware
    /// Board model
    pub const GET_BOARD_MODEL: u32 = 0x0001_0001;
    /// Board revision
    pub const GET_BOARD_REVISION: u32 = 0x0001_0002;
    /// Ethernet MAC address
    pub const GET_MAC_ADDRESS: u32 = 0x0001_0003;
    /// Board serial number
    pub const GET_BOARD_SERIAL: u32 = 0x0001_0004;
    /// ARM memory base and size
    pub const GET_ARM_MEMORY: u32 = 0x0001_0005;
    /// VideoCore memory base and size
    pub const GET_VC_MEMORY: u32 = 0x0001_0006;

    // Power
    /// Switch a device on or off
    pub const SET_POWER_STATE: u32 = 0x0002_8001;

    // Clocks
    /// Current clock rate
    pub const GET_CLOCK_RATE: u32 = 0x0003_0002;
    /// Maximum clock rate
    pub const GET_MAX_CLOCK_RATE: u32 = 0x0003_0004;
    /// SoC temperature
    pub const GET_TEMPERATURE: u32 = 0x0003_0006;
    /// Minimum clock rate
    pub const GET_MIN_CLOCK_RATE: u32 = 0x0003_0007;
    /// Turbo state
    pub const GET_TURBO: u32 = 0x0003_0009;
    /// Maximum safe temperature
    pub const GET_MAX_TEMPERATURE: u32 = 0x0003_000A;
    /// Monitor EDID block
    pub const GET_EDID_BLOCK: u32 = 0x0003_0020;
    /// Set a clock rate
    pub const SET_CLOCK_RATE: u32 = 0x0003_8002;
    /// Set turbo state
    pub const SET_TURBO: u32 = 0x0003_8009;

    // Frame buffer
    /// Allocate the frame buffer
    pub const ALLOCATE_BUFFER: u32 = 0x0004_0001;
    /// Physical display size
    pub const GET_DISPLAY_DIMENSIONS: u32 = 0x0004_0003;
    /// Bytes per line
    pub const GET_PITCH: u32 = 0x0004_0008;
    /// Touch screen buffer
    pub const GET_TOUCHBUF: u32 = 0x0004_000F;
    /// Virtual GPIO buffer
    pub const GET_GPIO_VIRTBUF: u32 = 0x0004_0010;
    /// Set physical display size
    pub const SET_PHYS_WIDTH_HEIGHT: u32 = 0x0004_8003;
    /// Set virtual display size
    pub const SET_VIRT_WIDTH_HEIGHT: u32 = 0x0004_8004;
    /// Set colour depth
    pub const SET_DEPTH: u32 = 0x0004_8005;
    /// Set virtual offset
    pub const SET_VIRTUAL_OFFSET: u32 = 0x0004_8009;
    /// Set palette entries
    pub const SET_PALETTE: u32 = 0x0004_800B;
    /// Wait for vertical sync
    pub const WAIT_FOR_VSYNC: u32 = 0x0004_800E;
    /// Set touch screen buffer
    pub const SET_TOUCHBUF: u32 = 0x0004_801F;
    /// Set virtual GPIO buffer
    pub const SET_GPIO_VIRTBUF: u32 = 0x0004_8020;

    // Command line
    /// Kernel command line
    pub const GET_COMMAND_LINE: u32 = 0x0005_0001;
}

/// Set in a tag's length field by the firmware when it has responded
pub const RESPONSE_BIT: u32 = 1 << 31;

/// Fixed part of every tag
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagHeader {
    /// Tag identifier
    pub tag_id: u32,
    /// Size of the value buffer in bytes
    pub value_buf_size: u32,
    /// Request length, or [`RESPONSE_BIT`] plus response length
    pub value_length: u32,
}

/// A tag with `N` 32-bit value words
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag<const N: usize> {
    /// Tag header
    pub header: TagHeader,
    /// Value buffer
    pub value: [u32; N],
}

impl<const N: usize> Tag<N> {
    /// Tag carrying `value` as request parameters
    pub const fn new(value: [u32; N]) -> Self {
        Self {
            header: TagHeader {
                tag_id: 0,
                value_buf_size: 0,
                value_length: 0,
            },
            value,
        }
    }

    /// Fill in the header for a request
    pub fn prepare(&mut self, tag_id: u32, request_len: u32) {
        self.header.tag_id = tag_id;
        self.header.value_buf_size = (N * size_of::<u32>()) as u32;
        self.header.value_length = request_len & !RESPONSE_BIT;
    }
}

impl<const N: usize> Default for Tag<N> {
    fn default() -> Self {
        Self::new([0; N])
    }
}

/// Types that are a plain sequence of 32-bit words
///
/// # Safety
/// Implementors must be `#[repr(C)]` (or arrays of such types), built only
/// from `u32` fields, with no padding.
pub unsafe trait TagWords: Sized {
    /// View as words
    fn as_words(&self) -> &[u32] {
        // SAFETY: trait contract: Self is a padding-free sequence of u32
        unsafe {
            core::slice::from_raw_parts(
                (self as *const Self).cast::<u32>(),
                size_of::<Self>() / size_of::<u32>(),
            )
        }
    }

    /// Mutable view as words
    fn as_words_mut(&mut self) -> &mut [u32] {
        // SAFETY: trait contract: Self is a padding-free sequence of u32
        unsafe {
            core::slice::from_raw_parts_mut(
                (self as *mut Self).cast::<u32>(),
                size_of::<Self>() / size_of::<u32>(),
            )
        }
    }
}

// SAFETY: repr(C) header of three u32 followed by [u32; N]
unsafe impl<const N: usize> TagWords for Tag<N> {}

// SAFETY: arrays of padding-free word sequences are padding-free
unsafe impl<T: TagWords, const M: usize> TagWords for [T; M] {}

static_assertions::assert_eq_size!(TagHeader, [u32; 3]);
static_assertions::assert_eq_size!(Tag<2>, [u32; 5]);
static_assertions::assert_eq_align!(Tag<6>, u32);

/// Firmware clock identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClockId {
    /// EMMC controller base clock
    Emmc = 1,
    /// PL011 UART
    Uart = 2,
    /// ARM core
    Arm = 3,
    /// VideoCore core
    Core = 4,
    /// 3D block
    V3d = 5,
    /// H.264 block
    H264 = 6,
    /// Image sensor pipeline
    Isp = 7,
    /// SDRAM
    Sdram = 8,
    /// Pixel valve
    Pixel = 9,
    /// PWM
    Pwm = 10,
}

/// Firmware power domain identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceId {
    /// SD card slot
    SdCard = 0,
    /// UART 0
    Uart0 = 1,
    /// UART 1
    Uart1 = 2,
    /// USB host controller
    UsbHcd = 3,
}

bitflags! {
    /// `SET_POWER_STATE` request bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PowerRequest: u32 {
        /// Power the device on
        const ON = 1 << 0;
        /// Return only once the device is stable
        const WAIT = 1 << 1;
    }
}

bitflags! {
    /// `SET_POWER_STATE` response bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PowerStatus: u32 {
        /// Device is powered
        const ON = 1 << 0;
        /// Device does not exist
        const NO_DEVICE = 1 << 1;
    }
}
