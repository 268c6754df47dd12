//! Board memory maps and tunables

use stos_hal::arch::bcm2835::{systimer::TIMER_CLOCK_HZ, IoBase};
use stos_hal::timer::TICK_HZ;
use stos_io::emmc::EmmcConfig;

/// System tick parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickConfig {
    /// Tick interrupts per second
    pub hz: u32,
    /// Rate of the free-running counter
    pub timer_clock_hz: u32,
}

impl TickConfig {
    /// 200 Hz tick on the 1 MHz system timer
    pub const DEFAULT: Self = Self {
        hz: TICK_HZ,
        timer_clock_hz: TIMER_CLOCK_HZ,
    };

    /// Counter ticks between two tick interrupts
    pub const fn interval(&self) -> u32 {
        self.timer_clock_hz / self.hz
    }
}

/// Everything that differs between boards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    /// Board name for the boot log
    pub name: &'static str,
    /// Peripheral window and VideoCore bus alias
    pub io_base: IoBase,
    /// System tick
    pub tick: TickConfig,
    /// SD card driver settings
    pub emmc: EmmcConfig,
}

impl Platform {
    /// Raspberry Pi 1 / Zero
    pub const RPI1: Self = Self {
        name: "Raspberry Pi 1",
        io_base: IoBase::Bcm2835,
        tick: TickConfig::DEFAULT,
        emmc: emmc_config(),
    };

    /// Raspberry Pi 2 / 3
    pub const RPI2: Self = Self {
        name: "Raspberry Pi 2/3",
        io_base: IoBase::Bcm2836,
        tick: TickConfig::DEFAULT,
        emmc: emmc_config(),
    };

    /// The board selected at build time; `rpi1` wins over the default
    pub const fn current() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(feature = "rpi1")] {
                Self::RPI1
            } else {
                Self::RPI2
            }
        }
    }

    /// ARM physical address of a peripheral block
    pub const fn block(&self, offset: usize) -> usize {
        self.io_base.block(offset)
    }

    /// Whether the core-local interrupt bank exists; the interrupt
    /// controller picks its bank layout from this
    pub const fn has_local_bank(&self) -> bool {
        self.io_base.local_base().is_some()
    }
}

const fn emmc_config() -> EmmcConfig {
    let mut config = EmmcConfig::new();
    config.write_protect = !cfg!(feature = "sd-write");
    config.enable_1_8v = cfg!(feature = "sd-1v8");
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use stos_hal::arch::bcm2835::offsets;

    #[test]
    fn test_board_memory_maps() {
        assert_eq!(Platform::RPI1.block(offsets::MAILBOX), 0x2000_B880);
        assert_eq!(Platform::RPI2.block(offsets::EMMC), 0x3F30_0000);
        assert_eq!(Platform::RPI1.io_base.gpu_mem_base(), 0x4000_0000);
        assert_eq!(Platform::RPI2.io_base.gpu_mem_base(), 0xC000_0000);
        assert!(!Platform::RPI1.has_local_bank());
        assert!(Platform::RPI2.has_local_bank());
    }

    #[test]
    fn test_tick_interval() {
        assert_eq!(TickConfig::DEFAULT.hz, 200);
        assert_eq!(TickConfig::DEFAULT.interval(), 5000);
    }

    #[test]
    fn test_default_features() {
        let platform = Platform::current();
        assert_eq!(platform.emmc.write_protect, !cfg!(feature = "sd-write"));
        assert_eq!(platform.emmc.max_retries, 3);
        if !cfg!(feature = "rpi1") {
            assert_eq!(platform, Platform::RPI2);
        }
    }
}
