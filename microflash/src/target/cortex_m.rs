//! Cortex-M core control through the debug registers.
//!
//! Halt, resume, reset and register access all go through the memory-mapped
//! debug block (DHCSR, DCRSR, DCRDR, DEMCR) and the system control block.

use {
    crate::{
        error::{Error, Result},
        is_interrupted_requested,
        target::Session,
        transport::Transport,
    },
    log::{debug, trace},
    std::{
        thread,
        time::{Duration, Instant},
    },
};

/// Debug halting control and status register.
pub const DHCSR: u32 = 0xE000_EDF0;
/// Debug core register selector.
pub const DCRSR: u32 = 0xE000_EDF4;
/// Debug core register data.
pub const DCRDR: u32 = 0xE000_EDF8;
/// Debug exception and monitor control.
pub const DEMCR: u32 = 0xE000_EDFC;
/// Application interrupt and reset control.
pub const NVIC_AIRCR: u32 = 0xE000_ED0C;
/// Debug fault status.
pub const DFSR: u32 = 0xE000_ED30;

/// DHCSR bits.
pub mod dhcsr {
    /// Core has been reset since the last read.
    pub const S_RESET_ST: u32 = 1 << 25;
    /// Core is halted.
    pub const S_HALT: u32 = 1 << 17;
    /// Core register transfer complete.
    pub const S_REGRDY: u32 = 1 << 16;
    /// Halting debug enabled.
    pub const C_DEBUGEN: u32 = 1 << 0;
    /// Halt request.
    pub const C_HALT: u32 = 1 << 1;
    /// Key required on every write.
    pub const DBGKEY: u32 = 0xA05F << 16;
}

/// DCRSR: write the selected register.
pub const DCRSR_REGWNR: u32 = 1 << 16;

/// DEMCR: halt on core reset.
pub const DEMCR_VC_CORERESET: u32 = 1 << 0;

/// AIRCR key required on every write.
pub const AIRCR_VECTKEY: u32 = 0x5FA << 16;
/// AIRCR system reset request.
pub const AIRCR_SYSRESETREQ: u32 = 1 << 2;

/// DFSR bits, write one to clear.
pub mod dfsr {
    /// Halt request or step.
    pub const HALTED: u32 = 1 << 0;
    /// Breakpoint.
    pub const BKPT: u32 = 1 << 1;
    /// Watchpoint.
    pub const DWTTRAP: u32 = 1 << 2;
    /// Vector catch.
    pub const VCATCH: u32 = 1 << 3;
    /// External debug request.
    pub const EXTERNAL: u32 = 1 << 4;
}

/// Stack pointer register number.
pub const REG_SP: u32 = 13;
/// Link register number.
pub const REG_LR: u32 = 14;
/// Program counter register number.
pub const REG_PC: u32 = 15;

/// Most argument registers [`Session::execute`] will load.
pub const MAX_EXECUTE_ARGS: usize = 12;

/// Attempts to observe S_REGRDY after a core register transfer.
const MAX_REGRDY_ATTEMPTS: usize = 100;

/// Delay between status polls.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

impl<T: Transport> Session<T> {
    /// Returns true if the core is halted.
    pub fn is_halted(&mut self) -> Result<bool> {
        let status = self.read_mem32(DHCSR)?;
        Ok(status & dhcsr::S_HALT != 0)
    }

    /// Request a halt, optionally waiting until the core reports it.
    pub fn halt(&mut self, wait: bool) -> Result<()> {
        let deadline = Instant::now() + self.timeouts().halt;
        self.halt_until(wait, deadline)
    }

    fn halt_until(&mut self, wait: bool, deadline: Instant) -> Result<()> {
        self.write_mem32(DHCSR, dhcsr::DBGKEY | dhcsr::C_DEBUGEN | dhcsr::C_HALT)?;
        if wait {
            self.wait_for_halt_until(deadline)?;
        }
        Ok(())
    }

    /// Let a halted core run. Does nothing if it is already running.
    pub fn resume(&mut self) -> Result<()> {
        if !self.is_halted()? {
            return Ok(());
        }

        self.write_mem32(DFSR, dfsr::DWTTRAP | dfsr::BKPT | dfsr::HALTED)?;
        self.write_mem32(DHCSR, dhcsr::DBGKEY | dhcsr::C_DEBUGEN)
    }

    /// Poll until the core halts or `timeout` passes.
    pub fn wait_for_halt(&mut self, timeout: Duration) -> Result<()> {
        self.wait_for_halt_until(Instant::now() + timeout)
    }

    fn wait_for_halt_until(&mut self, deadline: Instant) -> Result<()> {
        loop {
            if self.is_halted()? {
                return Ok(());
            }
            if is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("waiting for core to halt".to_string()));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Write a core register. The core must be halted.
    pub fn write_core_register(&mut self, reg: u32, value: u32) -> Result<()> {
        self.write_mem32(DCRDR, value)?;
        self.write_mem32(DCRSR, reg | DCRSR_REGWNR)?;
        self.wait_for_regrdy()
    }

    /// Read a core register. The core must be halted.
    pub fn read_core_register(&mut self, reg: u32) -> Result<u32> {
        self.write_mem32(DCRSR, reg)?;
        self.wait_for_regrdy()?;
        self.read_mem32(DCRDR)
    }

    fn wait_for_regrdy(&mut self) -> Result<()> {
        for _ in 0..MAX_REGRDY_ATTEMPTS {
            if self.read_mem32(DHCSR)? & dhcsr::S_REGRDY != 0 {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
        Err(Error::Timeout("core register transfer".to_string()))
    }

    /// Load `code` at `addr` and run it to completion.
    ///
    /// The routine must end in a breakpoint. `args` are loaded into r0
    /// upwards.
    ///
    /// # Arguments
    ///
    /// * `addr` - RAM address to load the code at.
    /// * `code` - Thumb code as little-endian words.
    /// * `sp` - Initial stack pointer.
    /// * `pc` - Entry point (with the Thumb bit set).
    /// * `lr` - Return address.
    /// * `args` - Values for r0 to r11.
    pub fn execute(
        &mut self,
        addr: u32,
        code: &[u32],
        sp: u32,
        pc: u32,
        lr: u32,
        args: &[u32],
    ) -> Result<()> {
        if args.len() > MAX_EXECUTE_ARGS {
            return Err(Error::InvalidArgument(format!(
                "{} argument registers (max {MAX_EXECUTE_ARGS})",
                args.len()
            )));
        }

        self.halt(true)?;
        self.write_block(addr, code)?;
        self.write_core_register(REG_PC, pc)?;
        self.write_core_register(REG_LR, lr)?;
        self.write_core_register(REG_SP, sp)?;
        for (reg, value) in (0u32..).zip(args) {
            self.write_core_register(reg, *value)?;
        }

        trace!("Executing {} words at {addr:#010x}", code.len());
        self.resume()?;
        let timeout = self.timeouts().halt;
        self.wait_for_halt(timeout)
    }

    /// Request a system reset and wait for the core to leave reset.
    pub fn software_reset(&mut self, deadline: Instant) -> Result<()> {
        self.write_mem32(NVIC_AIRCR, AIRCR_VECTKEY | AIRCR_SYSRESETREQ)?;

        while self.read_mem32(DHCSR)? & dhcsr::S_RESET_ST != 0 {
            if is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("target stuck in reset".to_string()));
            }
            thread::sleep(POLL_INTERVAL);
        }

        Ok(())
    }

    /// Reset the target, optionally leaving it halted at the reset vector.
    pub fn reset(&mut self, halt: bool) -> Result<()> {
        let deadline = Instant::now() + self.timeouts().halt;
        self.reset_until(halt, deadline)
    }

    /// Like [`Session::reset`], giving up once `deadline` passes.
    pub fn reset_until(&mut self, halt: bool, deadline: Instant) -> Result<()> {
        debug!("Resetting target (halt: {halt})");

        if !halt {
            return self.software_reset(deadline);
        }

        self.halt_until(true, deadline)?;
        let demcr = self.read_mem32(DEMCR)?;
        self.write_mem32(DEMCR, demcr | DEMCR_VC_CORERESET)?;

        let result = self
            .software_reset(deadline)
            .and_then(|()| self.wait_for_halt_until(deadline));
        let restored = self.write_mem32(DEMCR, demcr);

        result.and(restored)
    }
}
