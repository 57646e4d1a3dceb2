//! C5: user-space stack unwinding (spec §4.5). Wraps `framehop`'s
//! frame-pointer-free DWARF unwinder; grounded on
//! `linux_shared/converter.rs`'s `Unwinder::iter_frames` loop and
//! `convert_regs.rs`'s per-arch register mapping.

use framehop::{FrameAddress, Unwinder as _};

use crate::perf::sample_parser::SampleRecord;
use crate::perf::sys::{PERF_REG_X86_BP, PERF_REG_X86_IP, PERF_REG_X86_SP};

#[cfg(target_arch = "x86_64")]
pub type ArchUnwinder = framehop::x86_64::UnwinderX86_64<Vec<u8>>;
#[cfg(target_arch = "aarch64")]
pub type ArchUnwinder = framehop::aarch64::UnwinderAarch64<Vec<u8>>;

#[cfg(target_arch = "x86_64")]
pub type ArchCache = framehop::x86_64::CacheX86_64<Vec<u8>>;
#[cfg(target_arch = "aarch64")]
pub type ArchCache = framehop::aarch64::CacheAarch64<Vec<u8>>;

#[cfg(target_arch = "x86_64")]
pub type ArchUnwindRegs = framehop::x86_64::UnwindRegsX86_64;
#[cfg(target_arch = "aarch64")]
pub type ArchUnwindRegs = framehop::aarch64::UnwindRegsAarch64;

/// The outcome of walking one sample's stack: a list of return addresses
/// from innermost to outermost, plus whether the walk ran to completion
/// or was cut short.
#[derive(Debug, Clone)]
pub struct WalkedStack {
    pub addresses: Vec<u64>,
    pub truncated: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnwindStats {
    pub samples_walked: u64,
    pub samples_truncated: u64,
    pub samples_missing_stack: u64,
}

pub struct StackUnwinder {
    unwinder: ArchUnwinder,
    cache: ArchCache,
    stats: UnwindStats,
    /// Hard cap on frames returned per sample, independent of how far the
    /// unwinder itself is willing to walk; keeps one pathological stack
    /// from dominating a profile's aggregation cost.
    max_frames: usize,
}

impl StackUnwinder {
    pub fn new(max_frames: usize) -> Self {
        StackUnwinder {
            unwinder: ArchUnwinder::new(),
            cache: ArchCache::new(),
            stats: UnwindStats::default(),
            max_frames,
        }
    }

    pub fn stats(&self) -> UnwindStats {
        self.stats
    }

    /// Registers (or replaces) unwind info for one mapped module, so the
    /// unwinder can find CFI for addresses inside it. `base_addr` is the
    /// module's load address; `text` is the raw file bytes of the module
    /// (used to derive `.eh_frame`/`.debug_frame` via the `object` crate
    /// in the symbol table, not re-parsed here).
    pub fn add_module(&mut self, module: framehop::Module<Vec<u8>>) {
        self.unwinder.add_module(module);
    }

    /// Walks the stack captured in `sample`, registers-first then the
    /// copied stack memory, following the ABI the sample's `regs_abi`
    /// reports.
    pub fn walk(&mut self, sample: &SampleRecord<'_>) -> Option<WalkedStack> {
        let Some(ip) = sample.ip else {
            self.stats.samples_missing_stack += 1;
            return None;
        };

        // The kernel drops STACK_USER when the ring buffer is under
        // pressure (dyn_size == 0). Rather than discard the sample, emit
        // a single incomplete frame at the sampled IP — still attributes
        // the time to the right leaf function, just with no callers.
        let Some(stack) = sample.user_stack else {
            self.stats.samples_missing_stack += 1;
            self.stats.samples_walked += 1;
            self.stats.samples_truncated += 1;
            return Some(WalkedStack {
                addresses: vec![ip],
                truncated: true,
            });
        };

        let regs = build_unwind_regs(sample)?;
        let sp = regs_sp(sample).unwrap_or(0);

        let mut read_stack = |addr: u64| -> Result<u64, ()> {
            read_from_captured_stack(stack, sp, addr).ok_or(())
        };

        let mut addresses = Vec::new();
        let mut truncated = false;
        let iter = self.unwinder.iter_frames(
            FrameAddress::InstructionPointer(ip),
            regs,
            &mut self.cache,
            &mut read_stack,
        );

        for frame in iter {
            if addresses.len() >= self.max_frames {
                truncated = true;
                break;
            }
            match frame {
                Ok(address) => addresses.push(address.address()),
                Err(_) => {
                    truncated = true;
                    break;
                }
            }
        }

        self.stats.samples_walked += 1;
        if truncated {
            self.stats.samples_truncated += 1;
        }

        Some(WalkedStack { addresses, truncated })
    }
}

#[cfg(target_arch = "x86_64")]
fn build_unwind_regs(sample: &SampleRecord<'_>) -> Option<ArchUnwindRegs> {
    let ip = reg_at(sample, PERF_REG_X86_IP)?;
    let sp = reg_at(sample, PERF_REG_X86_SP)?;
    let bp = reg_at(sample, PERF_REG_X86_BP)?;
    Some(framehop::x86_64::UnwindRegsX86_64::new(ip, sp, bp))
}

#[cfg(target_arch = "aarch64")]
fn build_unwind_regs(sample: &SampleRecord<'_>) -> Option<ArchUnwindRegs> {
    use crate::perf::sys::{PERF_REG_ARM64_LR, PERF_REG_ARM64_PC, PERF_REG_ARM64_SP};
    let pc = reg_at(sample, PERF_REG_ARM64_PC)?;
    let lr = reg_at(sample, PERF_REG_ARM64_LR)?;
    let sp = reg_at(sample, PERF_REG_ARM64_SP)?;
    Some(framehop::aarch64::UnwindRegsAarch64::new(lr, sp, pc))
}

#[cfg(target_arch = "x86_64")]
fn regs_sp(sample: &SampleRecord<'_>) -> Option<u64> {
    reg_at(sample, PERF_REG_X86_SP)
}

#[cfg(target_arch = "aarch64")]
fn regs_sp(sample: &SampleRecord<'_>) -> Option<u64> {
    use crate::perf::sys::PERF_REG_ARM64_SP;
    reg_at(sample, PERF_REG_ARM64_SP)
}

/// The kernel packs saved registers densely in the order their bits are
/// set in `sample_regs_user`; since this profiler always requests the
/// same fixed mask (IP/SP/BP or PC/LR/SP), the index is just that
/// register's position among the requested set.
fn reg_at(sample: &SampleRecord<'_>, perf_reg: u64) -> Option<u64> {
    #[cfg(target_arch = "x86_64")]
    let requested = [PERF_REG_X86_BP, PERF_REG_X86_SP, PERF_REG_X86_IP];
    #[cfg(target_arch = "aarch64")]
    let requested = {
        use crate::perf::sys::{PERF_REG_ARM64_LR, PERF_REG_ARM64_SP, PERF_REG_ARM64_X29};
        [PERF_REG_ARM64_X29, PERF_REG_ARM64_LR, PERF_REG_ARM64_SP]
    };
    let mut sorted = requested;
    sorted.sort_unstable();
    let position = sorted.iter().position(|&r| r == perf_reg)?;
    sample.regs.get(position).copied()
}

/// The kernel's `STACK_USER` payload is a raw copy of `[sp, sp+size)`
/// memory, so reading "the value at address `addr`" means indexing by
/// `addr - sp` into the copied bytes, not reading live process memory.
fn read_from_captured_stack(stack: &[u8], sp: u64, addr: u64) -> Option<u64> {
    let offset = addr.checked_sub(sp)?;
    let start = offset as usize;
    let bytes = stack.get(start..start + 8)?;
    Some(u64::from_ne_bytes(bytes.try_into().ok()?))
}
