//! SD command numbers and their CMDTM encodings

use core::fmt;

// =============================================================================
// COMMAND REGISTER LAYOUT
// =============================================================================

/// CMDTM field values
pub mod cmdtm {
    /// Abort command (CMD12)
    pub const TYPE_ABORT: u32 = 3 << 22;
    /// Command type field
    pub const TYPE_MASK: u32 = 3 << 22;
    /// Command has a data phase
    pub const ISDATA: u32 = 1 << 21;
    /// Check the response index
    pub const IXCHK_EN: u32 = 1 << 20;
    /// Check the response CRC
    pub const CRCCHK_EN: u32 = 1 << 19;
    /// 136-bit response
    pub const RSPNS_136: u32 = 1 << 16;
    /// 48-bit response
    pub const RSPNS_48: u32 = 2 << 16;
    /// 48-bit response using the busy line
    pub const RSPNS_48B: u32 = 3 << 16;
    /// Response type field
    pub const RSPNS_MASK: u32 = 3 << 16;
    /// Multi-block transfer
    pub const MULTI_BLOCK: u32 = 1 << 5;
    /// Data direction card to host
    pub const DAT_DIR_CH: u32 = 1 << 4;
    /// Send CMD12 after the last block
    pub const AUTO_CMD12: u32 = 1 << 2;
    /// Use the block counter
    pub const BLKCNT_EN: u32 = 1 << 1;
}

use cmdtm::*;

const R1: u32 = RSPNS_48 | CRCCHK_EN;
const R1B: u32 = RSPNS_48B | CRCCHK_EN;
const R2: u32 = RSPNS_136 | CRCCHK_EN;
const R3: u32 = RSPNS_48;
const R4: u32 = RSPNS_136;
const R6: u32 = RSPNS_48 | CRCCHK_EN;
const R7: u32 = RSPNS_48 | CRCCHK_EN;

const DATA_READ: u32 = ISDATA | DAT_DIR_CH;
const DATA_WRITE: u32 = ISDATA;
const MULTI: u32 = MULTI_BLOCK | BLKCNT_EN | AUTO_CMD12;

/// Shape of the card's response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    /// No response
    None,
    /// 136-bit response in RESP0..RESP3
    Long,
    /// 48-bit response in RESP0
    Short,
    /// 48-bit response, then busy signalling on DAT0
    ShortBusy,
}

/// A complete CMDTM value, or the reserved marker
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandWord(u32);

impl CommandWord {
    /// Marks an index that must never be issued
    pub const RESERVED: Self = Self(u32::MAX);

    const fn new(index: u32, flags: u32) -> Self {
        Self((index << 24) | flags)
    }

    /// Raw register value
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether this is the reserved marker
    pub const fn is_reserved(self) -> bool {
        self.0 == Self::RESERVED.0
    }

    /// Response shape
    pub const fn response(self) -> ResponseType {
        match self.0 & RSPNS_MASK {
            RSPNS_136 => ResponseType::Long,
            RSPNS_48 => ResponseType::Short,
            RSPNS_48B => ResponseType::ShortBusy,
            _ => ResponseType::None,
        }
    }

    /// Whether the command moves data blocks
    pub const fn has_data(self) -> bool {
        self.0 & ISDATA != 0
    }

    /// Whether data flows from the card to the host
    pub const fn is_read(self) -> bool {
        self.0 & DAT_DIR_CH != 0
    }

    /// Whether completion is signalled by transfer complete
    pub const fn waits_for_transfer(self) -> bool {
        self.has_data() || matches!(self.response(), ResponseType::ShortBusy)
    }
}

impl fmt::Debug for CommandWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_reserved() {
            f.write_str("CommandWord(reserved)")
        } else {
            write!(f, "CommandWord({:#010x})", self.0)
        }
    }
}

const RSVD: CommandWord = CommandWord::RESERVED;

const fn cmd(index: u32, flags: u32) -> CommandWord {
    CommandWord::new(index, flags)
}

/// CMDTM values of CMD0..CMD63
pub static SD_COMMANDS: [CommandWord; 64] = [
    cmd(0, 0),
    RSVD,
    cmd(2, R2),
    cmd(3, R6),
    cmd(4, 0),
    cmd(5, R4),
    cmd(6, R1),
    cmd(7, R1B),
    cmd(8, R7),
    cmd(9, R2),
    cmd(10, R2),
    cmd(11, R1),
    cmd(12, R1B | TYPE_ABORT),
    cmd(13, R1),
    RSVD,
    cmd(15, 0),
    cmd(16, R1),
    cmd(17, R1 | DATA_READ),
    cmd(18, R1 | DATA_READ | MULTI),
    cmd(19, R1 | DATA_READ),
    cmd(20, R1B),
    RSVD,
    RSVD,
    cmd(23, R1),
    cmd(24, R1 | DATA_WRITE),
    cmd(25, R1 | DATA_WRITE | MULTI),
    RSVD,
    cmd(27, R1 | DATA_WRITE),
    cmd(28, R1B),
    cmd(29, R1B),
    cmd(30, R1 | DATA_READ),
    RSVD,
    cmd(32, R1),
    cmd(33, R1),
    RSVD,
    RSVD,
    RSVD,
    RSVD,
    cmd(38, R1B),
    RSVD,
    RSVD,
    RSVD,
    // LOCK_UNLOCK is not supported
    RSVD,
    RSVD,
    RSVD,
    RSVD,
    RSVD,
    RSVD,
    RSVD,
    RSVD,
    RSVD,
    RSVD,
    RSVD,
    RSVD,
    RSVD,
    cmd(55, R1),
    cmd(56, R1 | ISDATA),
    RSVD,
    RSVD,
    RSVD,
    RSVD,
    RSVD,
    RSVD,
    RSVD,
];

/// CMDTM values of ACMD0..ACMD63
pub static APP_COMMANDS: [CommandWord; 64] = {
    let mut table = [RSVD; 64];
    table[6] = cmd(6, R1);
    table[13] = cmd(13, R1);
    table[22] = cmd(22, R1 | DATA_READ);
    table[23] = cmd(23, R1);
    table[41] = cmd(41, R3);
    table[42] = cmd(42, R1);
    table[51] = cmd(51, R1 | DATA_READ);
    table
};

// =============================================================================
// COMMAND NUMBERS
// =============================================================================

/// A command number, with the application namespace in the top bit
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Command(u32);

impl Command {
    const IS_APP: u32 = 1 << 31;

    /// GO_IDLE_STATE
    pub const GO_IDLE_STATE: Self = Self::sd(0);
    /// ALL_SEND_CID
    pub const ALL_SEND_CID: Self = Self::sd(2);
    /// SEND_RELATIVE_ADDR
    pub const SEND_RELATIVE_ADDR: Self = Self::sd(3);
    /// IO_SET_OP_COND, answered by SDIO cards only
    pub const IO_SET_OP_COND: Self = Self::sd(5);
    /// SELECT_CARD
    pub const SELECT_CARD: Self = Self::sd(7);
    /// SEND_IF_COND
    pub const SEND_IF_COND: Self = Self::sd(8);
    /// VOLTAGE_SWITCH
    pub const VOLTAGE_SWITCH: Self = Self::sd(11);
    /// STOP_TRANSMISSION
    pub const STOP_TRANSMISSION: Self = Self::sd(12);
    /// SEND_STATUS
    pub const SEND_STATUS: Self = Self::sd(13);
    /// SET_BLOCKLEN
    pub const SET_BLOCKLEN: Self = Self::sd(16);
    /// READ_SINGLE_BLOCK
    pub const READ_SINGLE_BLOCK: Self = Self::sd(17);
    /// READ_MULTIPLE_BLOCK
    pub const READ_MULTIPLE_BLOCK: Self = Self::sd(18);
    /// WRITE_BLOCK
    pub const WRITE_BLOCK: Self = Self::sd(24);
    /// WRITE_MULTIPLE_BLOCK
    pub const WRITE_MULTIPLE_BLOCK: Self = Self::sd(25);
    /// APP_CMD
    pub const APP_CMD: Self = Self::sd(55);

    /// SET_BUS_WIDTH
    pub const SET_BUS_WIDTH: Self = Self::app(6);
    /// SD_SEND_OP_COND
    pub const SD_SEND_OP_COND: Self = Self::app(41);
    /// SEND_SCR
    pub const SEND_SCR: Self = Self::app(51);

    /// CMD`index`
    pub const fn sd(index: u32) -> Self {
        Self(index)
    }

    /// ACMD`index`
    pub const fn app(index: u32) -> Self {
        Self(index | Self::IS_APP)
    }

    /// Command index without the namespace bit
    pub const fn index(self) -> u32 {
        self.0 & !Self::IS_APP
    }

    /// Whether this is an application command
    pub const fn is_app(self) -> bool {
        self.0 & Self::IS_APP != 0
    }

    /// The CMDTM value from the matching table
    pub fn word(self) -> CommandWord {
        let table = if self.is_app() { &APP_COMMANDS } else { &SD_COMMANDS };
        table.get(self.index() as usize).copied().unwrap_or(CommandWord::RESERVED)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_app() { "ACMD" } else { "CMD" };
        write!(f, "{}{}", prefix, self.index())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_indices_match_positions() {
        for (i, word) in SD_COMMANDS.iter().chain(APP_COMMANDS.iter()).enumerate() {
            if !word.is_reserved() {
                assert_eq!(word.bits() >> 24, (i % 64) as u32);
            }
        }
    }

    #[test]
    fn test_read_multiple_encoding() {
        let word = Command::READ_MULTIPLE_BLOCK.word();
        assert_eq!(word.bits(), 0x1222_0036 | CRCCHK_EN);
        assert!(word.has_data() && word.is_read());
        assert_eq!(word.response(), ResponseType::Short);
    }

    #[test]
    fn test_busy_and_data_wait_for_transfer() {
        assert!(Command::SELECT_CARD.word().waits_for_transfer());
        assert!(Command::WRITE_BLOCK.word().waits_for_transfer());
        assert!(!Command::WRITE_BLOCK.word().is_read());
        assert!(!Command::SEND_STATUS.word().waits_for_transfer());
        assert_eq!(Command::ALL_SEND_CID.word().response(), ResponseType::Long);
        assert_eq!(Command::GO_IDLE_STATE.word().response(), ResponseType::None);
    }

    #[test]
    fn test_namespaces() {
        assert_eq!(Command::SD_SEND_OP_COND.index(), 41);
        assert!(Command::SD_SEND_OP_COND.is_app());
        assert!(Command::sd(41).word().is_reserved());
        assert!(!Command::SD_SEND_OP_COND.word().is_reserved());
        assert!(Command::sd(64).word().is_reserved());
        assert_eq!(format!("{:?}", Command::SEND_SCR), "ACMD51");
    }
}
