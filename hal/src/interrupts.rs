//! # Interrupt Dispatch
//!
//! Interrupt lines are grouped into register banks. A controller exposes one
//! pending word per bank; lines are numbered consecutively through the
//! banks in priority order, so bank 0 holds lines `0..width(0)`, bank 1 the
//! next `width(1)` lines and so on.
//!
//! [`IrqDispatcher`] owns the handler table and runs at most one handler per
//! call to [`IrqDispatcher::dispatch`]. The exception return path re-enters
//! the dispatcher if more lines are still pending.

use crate::{HalError, HalResult};
use core::fmt;

/// Interrupt line number
pub type IrqLine = usize;

/// Maximum number of pending-register banks a controller can expose
pub const MAX_BANKS: usize = 4;

/// Something that services an interrupt line
pub trait IrqHandler: Sync {
    /// Service the interrupt
    fn handle(&self);
}

impl<F: Fn() + Sync> IrqHandler for F {
    fn handle(&self) {
        self()
    }
}

/// Number of lines in each pending-register bank, in scan order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankLayout {
    widths: [u8; MAX_BANKS],
    count: usize,
}

impl BankLayout {
    /// Build a layout from per-bank line counts
    ///
    /// Returns `None` for more than [`MAX_BANKS`] banks or a width above 32.
    pub const fn new(widths: &[u8]) -> Option<Self> {
        if widths.len() > MAX_BANKS {
            return None;
        }
        let mut out = [0u8; MAX_BANKS];
        let mut i = 0;
        while i < widths.len() {
            if widths[i] > 32 {
                return None;
            }
            out[i] = widths[i];
            i += 1;
        }
        Some(Self {
            widths: out,
            count: widths.len(),
        })
    }

    /// Number of banks
    pub const fn bank_count(&self) -> usize {
        self.count
    }

    /// Lines in `bank`
    pub const fn width(&self, bank: usize) -> u32 {
        self.widths[bank] as u32
    }

    /// Pending bits of `bank` that belong to real lines
    pub const fn mask(&self, bank: usize) -> u32 {
        match self.width(bank) {
            32 => u32::MAX,
            w => (1 << w) - 1,
        }
    }

    /// First line number of `bank`
    pub const fn base(&self, bank: usize) -> IrqLine {
        let mut line = 0;
        let mut i = 0;
        while i < bank {
            line += self.widths[i] as usize;
            i += 1;
        }
        line
    }

    /// Total number of lines
    pub const fn line_count(&self) -> usize {
        self.base(self.count)
    }

    /// Bank and bit position of `line`
    pub const fn locate(&self, line: IrqLine) -> Option<(usize, u32)> {
        let mut bank = 0;
        let mut base = 0;
        while bank < self.count {
            let width = self.widths[bank] as usize;
            if line < base + width {
                return Some((bank, (line - base) as u32));
            }
            base += width;
            bank += 1;
        }
        None
    }
}

/// Interrupt controller with banked pending/enable registers
pub trait InterruptController {
    /// Bank layout of this controller
    fn layout(&self) -> BankLayout;

    /// Mask every line and route nothing to FIQ
    fn init(&self);

    /// Raw pending word of `bank`
    fn pending(&self, bank: usize) -> u32;

    /// Unmask `line`
    fn enable_line(&self, line: IrqLine) -> HalResult<()>;

    /// Mask `line`
    fn disable_line(&self, line: IrqLine) -> HalResult<()>;
}

/// Handler table plus the controller it drives
///
/// `N` bounds the number of lines; a layout with more lines than `N` can
/// only use the first `N`.
pub struct IrqDispatcher<'h, C, const N: usize> {
    controller: C,
    handlers: [Option<&'h dyn IrqHandler>; N],
}

impl<'h, C: InterruptController, const N: usize> IrqDispatcher<'h, C, N> {
    /// Create a dispatcher with an empty handler table
    pub const fn new(controller: C) -> Self {
        Self {
            controller,
            handlers: [None; N],
        }
    }

    /// Mask all lines at the controller
    pub fn init(&self) {
        self.controller.init();
    }

    /// The controller behind the table
    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Register `handler` for `line`, returning the previous handler
    ///
    /// A `Some` handler unmasks the line, `None` masks it.
    pub fn connect(
        &mut self,
        line: IrqLine,
        handler: Option<&'h dyn IrqHandler>,
    ) -> HalResult<Option<&'h dyn IrqHandler>> {
        if line >= N || line >= self.controller.layout().line_count() {
            return Err(HalError::InvalidParameter);
        }

        let previous = core::mem::replace(&mut self.handlers[line], handler);
        match handler {
            Some(_) => self.controller.enable_line(line)?,
            None => self.controller.disable_line(line)?,
        }
        log::debug!("irq: line {} {}", line, if handler.is_some() { "connected" } else { "disconnected" });
        Ok(previous)
    }

    /// Whether a handler is registered for `line`
    pub fn is_connected(&self, line: IrqLine) -> bool {
        self.handlers.get(line).map_or(false, Option::is_some)
    }

    /// Service the first pending line that has a handler
    ///
    /// All pending registers are sampled once. Pending lines without a
    /// handler are masked and skipped. Returns the line whose handler ran.
    pub fn dispatch(&self) -> Option<IrqLine> {
        let layout = self.controller.layout();
        let mut pending = [0u32; MAX_BANKS];
        for (bank, word) in pending.iter_mut().enumerate().take(layout.bank_count()) {
            *word = self.controller.pending(bank) & layout.mask(bank);
        }

        for (bank, &word) in pending.iter().enumerate().take(layout.bank_count()) {
            let mut bits = word;
            while bits != 0 {
                let line = layout.base(bank) + bits.trailing_zeros() as usize;
                bits &= bits - 1;

                if let Some(handler) = self.handlers.get(line).copied().flatten() {
                    handler.handle();
                    return Some(line);
                }

                log::warn!("irq: spurious line {}, masking", line);
                if self.controller.disable_line(line).is_err() {
                    log::warn!("irq: line {} cannot be masked", line);
                }
            }
        }
        None
    }
}

impl<C: fmt::Debug, const N: usize> fmt::Debug for IrqDispatcher<'_, C, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connected = self.handlers.iter().filter(|h| h.is_some()).count();
        f.debug_struct("IrqDispatcher")
            .field("controller", &self.controller)
            .field("connected", &connected)
            .finish()
    }
}
