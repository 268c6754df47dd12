//! Arasan EMMC register map and bit layouts

use bitflags::bitflags;

/// Register offsets from the EMMC base
pub mod regs {
    /// Argument for ACMD23
    pub const ARG2: usize = 0x00;
    /// Block size and count
    pub const BLKSIZECNT: usize = 0x04;
    /// Command argument
    pub const ARG1: usize = 0x08;
    /// Command and transfer mode; writing starts the command
    pub const CMDTM: usize = 0x0C;
    /// Response bits 31:0
    pub const RESP0: usize = 0x10;
    /// Response bits 63:32
    pub const RESP1: usize = 0x14;
    /// Response bits 95:64
    pub const RESP2: usize = 0x18;
    /// Response bits 127:96
    pub const RESP3: usize = 0x1C;
    /// Data FIFO
    pub const DATA: usize = 0x20;
    /// Present state
    pub const STATUS: usize = 0x24;
    /// Host, power and block gap control
    pub const CONTROL0: usize = 0x28;
    /// Clock and reset control
    pub const CONTROL1: usize = 0x2C;
    /// Interrupt status, write 1 to clear
    pub const INTERRUPT: usize = 0x30;
    /// Status enable
    pub const IRPT_MASK: usize = 0x34;
    /// Signal enable towards the ARM
    pub const IRPT_EN: usize = 0x38;
    /// Host control 2
    pub const CONTROL2: usize = 0x3C;
    /// Slot interrupt status and host version
    pub const SLOTISR_VER: usize = 0xFC;
}

/// Present state register bits
pub mod status {
    /// Command line in use
    pub const CMD_INHIBIT: u32 = 1 << 0;
    /// Data lines in use
    pub const DAT_INHIBIT: u32 = 1 << 1;
    /// Card inserted
    pub const CARD_INSERTED: u32 = 1 << 16;
    /// Shift of the DAT[3:0] level field
    pub const DAT_LEVEL_SHIFT: u32 = 20;
    /// DAT[3:0] line levels
    pub const DAT_LEVEL: u32 = 0xF << DAT_LEVEL_SHIFT;
}

bitflags! {
    /// CONTROL0 bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Control0: u32 {
        /// 4-bit data bus
        const HCTL_DWIDTH = 1 << 1;
        /// 1.8V signalling; bus power on older controllers
        const SIGNAL_1V8 = 1 << 8;
        /// Bus voltage select
        const BUS_VOLTAGE = 0x7 << 9;
    }
}

bitflags! {
    /// CONTROL1 bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Control1: u32 {
        /// Internal clock enable
        const CLK_INTLEN = 1 << 0;
        /// Internal clock stable
        const CLK_STABLE = 1 << 1;
        /// SD clock enable
        const CLK_EN = 1 << 2;
        /// Clock generator select
        const CLK_GENSEL = 1 << 5;
        /// Divider bits 9:8
        const CLK_FREQ_MS2 = 0x3 << 6;
        /// Divider bits 7:0
        const CLK_FREQ8 = 0xFF << 8;
        /// Data timeout exponent
        const DATA_TOUNIT = 0xF << 16;
        /// Reset the whole host circuit
        const SRST_HC = 1 << 24;
        /// Reset the command line
        const SRST_CMD = 1 << 25;
        /// Reset the data lines
        const SRST_DATA = 1 << 26;
    }
}

impl Control1 {
    /// Divider and generator select, cleared before a clock change
    pub const CLOCK_FIELD: u32 = 0xFFE0;
    /// All three reset bits
    pub const RESET_ALL: u32 = 0x7 << 24;
    /// Shift of the data timeout exponent
    pub const DATA_TOUNIT_SHIFT: u32 = 16;
}

bitflags! {
    /// INTERRUPT, IRPT_MASK and IRPT_EN bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupt: u32 {
        /// Command complete
        const CMD_DONE = 1 << 0;
        /// Data transfer complete
        const DATA_DONE = 1 << 1;
        /// Block gap event
        const BLOCK_GAP = 1 << 2;
        /// DMA interrupt
        const DMA = 1 << 3;
        /// Buffer write ready
        const WRITE_RDY = 1 << 4;
        /// Buffer read ready
        const READ_RDY = 1 << 5;
        /// Card inserted
        const CARD_INSERTION = 1 << 6;
        /// Card removed
        const CARD_REMOVAL = 1 << 7;
        /// Card interrupt
        const CARD = 1 << 8;
        /// Some error bit is set
        const ERR = 1 << 15;
        /// Command timeout
        const CTO_ERR = 1 << 16;
        /// Command CRC error
        const CCRC_ERR = 1 << 17;
        /// Command end bit error
        const CEND_ERR = 1 << 18;
        /// Command index error
        const CBAD_ERR = 1 << 19;
        /// Data timeout
        const DTO_ERR = 1 << 20;
        /// Data CRC error
        const DCRC_ERR = 1 << 21;
        /// Data end bit error
        const DEND_ERR = 1 << 22;
        /// Current limit error
        const CURRENT_LIMIT = 1 << 23;
        /// Auto CMD12 error
        const ACMD_ERR = 1 << 24;
        /// ADMA error
        const ADMA_ERR = 1 << 25;
        /// Tuning error
        const TUNING_ERR = 1 << 26;
    }
}

impl Interrupt {
    /// The whole error half of the register
    pub const ERROR_MASK: u32 = 0xFFFF_0000;
}

/// Host controller versions from SLOTISR_VER bits 23:16
pub mod hci_version {
    /// SDHCI 1.0
    pub const V1: u32 = 0;
    /// SDHCI 2.0
    pub const V2: u32 = 1;
    /// SDHCI 3.0
    pub const V3: u32 = 2;
}
