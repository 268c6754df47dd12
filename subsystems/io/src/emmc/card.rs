//! Card registers and the per-card state learned during initialization

// =============================================================================
// CARD STATUS
// =============================================================================

/// Card status (R1 response)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardStatus(pub u32);

impl CardStatus {
    /// Ready for data
    pub const fn ready_for_data(&self) -> bool {
        (self.0 & (1 << 8)) != 0
    }

    /// Raw 4-bit state field
    pub const fn state_code(&self) -> u32 {
        (self.0 >> 9) & 0xF
    }

    /// Current state
    pub const fn current_state(&self) -> CardState {
        CardState::from_u8(self.state_code() as u8)
    }

    /// Error
    pub const fn error(&self) -> bool {
        (self.0 & (1 << 19)) != 0
    }

    /// Illegal command
    pub const fn illegal_command(&self) -> bool {
        (self.0 & (1 << 22)) != 0
    }

    /// COM CRC error
    pub const fn com_crc_error(&self) -> bool {
        (self.0 & (1 << 23)) != 0
    }

    /// Any of the error bits above
    pub const fn has_errors(&self) -> bool {
        self.error() || self.illegal_command() || self.com_crc_error()
    }
}

/// Card states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CardState {
    /// Idle state
    Idle = 0,
    /// Ready state
    Ready = 1,
    /// Identification state
    Ident = 2,
    /// Stand-by state
    Stby = 3,
    /// Transfer state
    Tran = 4,
    /// Data state
    Data = 5,
    /// Receive state
    Rcv = 6,
    /// Programming state
    Prg = 7,
    /// Disconnect state
    Dis = 8,
    /// Unknown or reserved state
    Unknown = 0xFF,
}

impl CardState {
    /// Decode the 4-bit state field
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => CardState::Idle,
            1 => CardState::Ready,
            2 => CardState::Ident,
            3 => CardState::Stby,
            4 => CardState::Tran,
            5 => CardState::Data,
            6 => CardState::Rcv,
            7 => CardState::Prg,
            8 => CardState::Dis,
            _ => CardState::Unknown,
        }
    }
}

/// SEND_RELATIVE_ADDR (R6) response
///
/// The low half carries a compressed card status: bits 23, 22 and 19 of
/// the R1 status moved down to 15, 14 and 13.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcaResponse(pub u32);

impl RcaResponse {
    /// Published relative card address
    pub const fn rca(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// CRC error on the previous command
    pub const fn crc_error(&self) -> bool {
        (self.0 & (1 << 15)) != 0
    }

    /// Illegal command
    pub const fn illegal_command(&self) -> bool {
        (self.0 & (1 << 14)) != 0
    }

    /// Generic error
    pub const fn error(&self) -> bool {
        (self.0 & (1 << 13)) != 0
    }

    /// Ready for data
    pub const fn ready_for_data(&self) -> bool {
        (self.0 & (1 << 8)) != 0
    }

    /// Whether the card reported any problem
    pub const fn is_usable(&self) -> bool {
        !self.crc_error() && !self.illegal_command() && !self.error() && self.ready_for_data()
    }
}

/// OCR bits of the SD_SEND_OP_COND exchange
pub mod ocr {
    /// 2.7V to 3.6V voltage window
    pub const VOLTAGE_WINDOW: u32 = 0x00FF_8000;
    /// Switching to 1.8V requested / accepted
    pub const S18A: u32 = 1 << 24;
    /// SDXC maximum performance
    pub const XPC: u32 = 1 << 28;
    /// High capacity support
    pub const HCS: u32 = 1 << 30;
    /// Card power up done
    pub const READY: u32 = 1 << 31;
}

// =============================================================================
// SCR REGISTER
// =============================================================================

/// SD Configuration Register
///
/// Stored in wire order, most significant byte first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scr {
    /// Raw SCR data (8 bytes)
    pub raw: [u8; 8],
}

impl Scr {
    /// Build from the two FIFO words of the SEND_SCR transfer
    pub fn from_fifo(words: [u32; 2]) -> Self {
        let mut raw = [0; 8];
        raw[..4].copy_from_slice(&words[0].to_le_bytes());
        raw[4..].copy_from_slice(&words[1].to_le_bytes());
        Self { raw }
    }

    /// SD spec version
    pub const fn sd_spec(&self) -> u8 {
        self.raw[0] & 0x0F
    }

    /// DAT bus widths supported
    pub const fn sd_bus_widths(&self) -> u8 {
        self.raw[1] & 0x0F
    }

    /// 4-bit bus width supported
    pub const fn supports_4bit(&self) -> bool {
        (self.raw[1] & 0x04) != 0
    }

    /// SD spec version 3.0 or higher
    pub const fn sd_spec3(&self) -> bool {
        (self.raw[2] & 0x80) != 0
    }

    /// SD spec version 4.0 or higher
    pub const fn sd_spec4(&self) -> bool {
        (self.raw[2] & 0x04) != 0
    }

    /// Physical layer version the card implements
    pub const fn sd_version(&self) -> SdVersion {
        match (self.sd_spec(), self.sd_spec3(), self.sd_spec4()) {
            (0, _, _) => SdVersion::V1_0,
            (1, _, _) => SdVersion::V1_1,
            (2, false, _) => SdVersion::V2_0,
            (2, true, false) => SdVersion::V3_0,
            (2, true, true) => SdVersion::V4_0,
            _ => SdVersion::Unknown,
        }
    }
}

/// SD specification version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SdVersion {
    /// Not read yet or not recognised
    #[default]
    Unknown,
    /// SD 1.0 / 1.01
    V1_0,
    /// SD 1.10
    V1_1,
    /// SD 2.00
    V2_0,
    /// SD 3.0x
    V3_0,
    /// SD 4.xx
    V4_0,
}

impl SdVersion {
    /// Human readable name
    pub const fn as_str(self) -> &'static str {
        match self {
            SdVersion::Unknown => "unknown",
            SdVersion::V1_0 => "1.0 or 1.01",
            SdVersion::V1_1 => "1.10",
            SdVersion::V2_0 => "2.00",
            SdVersion::V3_0 => "3.0x",
            SdVersion::V4_0 => "4.xx",
        }
    }
}

// =============================================================================
// CARD STATE
// =============================================================================

/// What the driver knows about the inserted card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardInfo {
    /// Host controller interface version (SLOTISR_VER bits 23:16)
    pub hci_version: u32,
    /// Base clock of the controller in Hz
    pub base_clock: u32,
    /// CID, RESP0 first
    pub cid: [u32; 4],
    /// OCR voltage bits from the final ACMD41
    pub ocr: u32,
    /// Block addressed (SDHC/SDXC)
    pub sdhc: bool,
    /// Card accepted 1.8V signalling
    pub supports_18v: bool,
    /// Relative card address; zero means the card must be initialized again
    pub rca: u16,
    /// SD configuration register
    pub scr: Scr,
}

impl CardInfo {
    /// Nothing known yet
    pub const fn new() -> Self {
        Self {
            hci_version: 0,
            base_clock: 0,
            cid: [0; 4],
            ocr: 0,
            sdhc: false,
            supports_18v: false,
            rca: 0,
            scr: Scr { raw: [0; 8] },
        }
    }

    /// RCA placed in the upper half of a command argument
    pub const fn rca_argument(&self) -> u32 {
        (self.rca as u32) << 16
    }
}

impl Default for CardInfo {
    fn default() -> Self {
        Self::new()
    }
}
