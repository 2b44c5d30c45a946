//! Virtual CPU (vCPU) Management
//!
//! This module provides the [`Vcpu`] type which represents a virtual processor
//! that can execute guest code. Each vCPU maintains its own register context,
//! execution state, and drives the per-vCPU interrupt/timer contexts that
//! `vgic.rs`/`vtimer.rs` own, plus the `vmodule.rs` notification points, on
//! every guest entry/exit.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                 Vcpu                    │
//! ├─────────────────────────────────────────┤
//! │  id: usize          - vCPU identifier   │
//! │  state: VcpuState   - Ready/Running/... │
//! │  mode: VcpuMode     - root/guest phase  │
//! ├─────────────────────────────────────────┤
//! │  VcpuContext                            │
//! │  ├─ gp_regs (x0-x30)                    │
//! │  ├─ sys_regs (ELR, SPSR, etc.)          │
//! │  ├─ pc (program counter)                │
//! │  └─ sp (stack pointer)                  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # State Machine
//!
//! ```text
//!                    ┌──────────────┐
//!                    │ Uninitialized│
//!                    └──────┬───────┘
//!                           │ new() / reset()
//!                           ▼
//!              ┌───────► Ready ◄───────┐
//!              │            │          │
//!              │            │ run()    │
//!              │            ▼          │
//!              │        Running ───────┘
//!              │            │    (guest exit)
//!              │            │
//!              │            ▼
//!              │        Stopped
//!              │            │
//!              └────────────┘
//!                  reset()
//! ```
//!
//! # Mode Tracking
//!
//! Grounded on `original_source/kernel/virt/vm.c`'s `vcpu_return_to_user`/
//! `vcpu_exit_from_user`: a vCPU's `mode` flips to `OutsideRoot` before the
//! `OS_HOOK_ENTER_TO_GUEST` hooks run, to `InGuest` right before the actual
//! guest entry, to `OutsideGuest` before `OS_HOOK_EXIT_FROM_GUEST`, and back
//! to `InRoot` once the hooks have run on exit. Other pCPUs reading `mode`
//! (e.g. to decide whether a reschedule IPI is needed — `vcpu->mode !=
//! IN_ROOT_MODE` in `vcpu_resched_handler`) see one of these four phases.
//!
//! # Example
//!
//! ```rust,ignore
//! use hypervisor::vcpu::Vcpu;
//!
//! // Create a vCPU with entry point and stack
//! let mut vcpu = Vcpu::new(0, 0x4000_0000, 0x4001_0000);
//!
//! // Run the guest
//! match vcpu.run() {
//!     Ok(()) => println!("Guest exited normally"),
//!     Err("WFI") => println!("Guest waiting for interrupt"),
//!     Err(e) => println!("Error: {}", e),
//! }
//! ```

use crate::arch::aarch64::vcpu_arch_state::VcpuArchState;
use crate::arch::aarch64::{VcpuContext, enter_guest};
use crate::vgic;
use crate::vmodule;
use crate::vtimer;

/// Virtual CPU execution state
///
/// Represents the current state of a vCPU in its lifecycle.
///
/// # State Transitions
///
/// | From | To | Trigger |
/// |------|-----|---------|
/// | `Uninitialized` | `Ready` | `new()` or `reset()` |
/// | `Ready` | `Running` | `run()` called |
/// | `Running` | `Ready` | Guest exit (HVC, WFI, etc.) |
/// | `Running` | `Stopped` | Fatal error |
/// | `Stopped` | `Ready` | `reset()` |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    /// vCPU has not been initialized with entry point
    Uninitialized,

    /// vCPU is ready to execute guest code
    Ready,

    /// vCPU is currently executing in guest mode (EL1)
    Running,

    /// vCPU has been stopped and cannot run
    Stopped,
}

/// Which side of the guest-entry boundary a vCPU is currently on.
///
/// `IN_ROOT_MODE`/`OUTSIDE_ROOT_MODE`/`IN_GUEST_MODE`/`OUTSIDE_GUEST_MODE`
/// in the original, renamed to Rust enum-variant case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuMode {
    /// Running hypervisor (EL2) code, not in the middle of a guest entry/exit.
    InRoot,
    /// Past the `OS_HOOK_ENTER_TO_GUEST` hooks, about to enter the guest.
    OutsideRoot,
    /// Currently executing guest code (the asm `enter_guest` call is live).
    InGuest,
    /// Guest has exited, `OS_HOOK_EXIT_FROM_GUEST` hooks are about to run.
    OutsideGuest,
}

/// Virtual CPU (vCPU)
///
/// Represents a single virtual processor that can execute guest code at EL1.
/// Each vCPU maintains its own register context, allowing multiple vCPUs
/// to run independently within a VM.
///
/// # Thread Safety
///
/// A `Vcpu` is **not** thread-safe. Only one physical CPU should access
/// a given `Vcpu` at a time. The hypervisor ensures this by binding vCPUs
/// to physical CPUs during scheduling.
///
/// # Register Context
///
/// The vCPU saves and restores all guest-visible registers on entry/exit:
/// - General purpose registers (x0-x30)
/// - Stack pointer (SP_EL1)
/// - Program counter (ELR_EL2)
/// - Processor state (SPSR_EL2)
/// - System registers (SCTLR_EL1, TTBR0_EL1, etc.)
pub struct Vcpu {
    /// Unique identifier for this vCPU. Doubles as the global task id that
    /// keys the per-vcpu tables in `vgic`/`vtimer` (see those modules'
    /// `*_by_id` functions).
    id: usize,

    /// Current state of the vCPU
    state: VcpuState,

    /// Current root/guest phase, per `vcpu_return_to_user`/
    /// `vcpu_exit_from_user`.
    mode: VcpuMode,

    /// Register context for this vCPU
    context: VcpuContext,

    /// GICv3 list registers, virtual timer shadow, and EL1 system registers
    /// not already covered by `context`/`exception.S`'s save-restore.
    arch_state: VcpuArchState,
}

impl Vcpu {
    /// Create a new vCPU
    ///
    /// # Arguments
    /// * `id` - Unique identifier for this vCPU
    /// * `entry_point` - Guest code entry point (physical address)
    /// * `stack_pointer` - Guest stack pointer
    pub fn new(id: usize, entry_point: u64, stack_pointer: u64) -> Self {
        vgic::install_context(id);
        vmodule::run_vcpu_init(id);
        let mut arch_state = VcpuArchState::new();
        arch_state.init_for_vcpu(id);
        Self {
            id,
            state: VcpuState::Ready,
            mode: VcpuMode::InRoot,
            context: VcpuContext::new(entry_point, stack_pointer),
            arch_state,
        }
    }

    /// Saved GICv3/timer/EL1 architectural state for this vCPU.
    pub fn arch_state(&self) -> &VcpuArchState {
        &self.arch_state
    }

    /// Mutable access, used by callers that seed or patch architectural
    /// state directly (e.g. PSCI CPU_ON boot-up, pending SGI/SPI injection).
    pub fn arch_state_mut(&mut self) -> &mut VcpuArchState {
        &mut self.arch_state
    }

    /// Get vCPU ID
    pub fn id(&self) -> usize {
        self.id
    }

    /// Get current state
    pub fn state(&self) -> VcpuState {
        self.state
    }

    /// Get current root/guest mode
    pub fn mode(&self) -> VcpuMode {
        self.mode
    }

    /// Get mutable reference to context
    pub fn context_mut(&mut self) -> &mut VcpuContext {
        &mut self.context
    }

    /// Get reference to context
    pub fn context(&self) -> &VcpuContext {
        &self.context
    }

    /// Run the vCPU
    ///
    /// This will enter the guest and execute code until an exit occurs.
    /// Mirrors `vcpu_return_to_user`/`enter_guest`/`vcpu_exit_from_user`:
    /// the mode flips to `OutsideRoot`, the `ENTER_TO_GUEST` notification
    /// points (vgic's List Register drain, the restored virtual timer, any
    /// registered `vmodule` hook) run, the mode flips to `InGuest` for the
    /// actual entry, and the mirror sequence runs in reverse on exit.
    ///
    /// # Returns
    /// * `Ok(())` - Guest exited normally (HVC #0)
    /// * `Err("WFI")` - Guest executed WFI (waiting for interrupt)
    /// * `Err(msg)` - Other error occurred
    pub fn run(&mut self) -> Result<(), &'static str> {
        if self.state != VcpuState::Ready {
            return Err("vCPU is not in Ready state");
        }

        self.state = VcpuState::Running;

        self.mode = VcpuMode::OutsideRoot;
        vgic::enter_to_guest_by_id(self.id);
        vtimer::restore_by_id(self.id);
        vmodule::run_enter_to_guest(self.id);
        self.arch_state.restore();
        self.mode = VcpuMode::InGuest;

        let result = unsafe { enter_guest(&mut self.context as *mut VcpuContext) };

        self.mode = VcpuMode::OutsideGuest;
        self.arch_state.save();
        vgic::exit_from_guest_by_id(self.id);
        vtimer::save_by_id(self.id, guest_timer_freq_hz(), 0, true);
        vmodule::run_exit_from_guest(self.id);
        self.mode = VcpuMode::InRoot;

        self.state = VcpuState::Ready;

        match result {
            0 => Ok(()),          // Normal exit (HVC #0)
            1 => Err("WFI"),      // Guest executed WFI
            _ => Err("Guest exit with error"),
        }
    }

    /// Stop the vCPU
    pub fn stop(&mut self) {
        self.state = VcpuState::Stopped;
        vgic::remove_context(self.id);
    }

    /// Reset the vCPU to initial state
    pub fn reset(&mut self, entry_point: u64, stack_pointer: u64) {
        self.context = VcpuContext::new(entry_point, stack_pointer);
        self.arch_state = VcpuArchState::new();
        self.arch_state.init_for_vcpu(self.id);
        self.state = VcpuState::Ready;
        self.mode = VcpuMode::InRoot;
        vgic::install_context(self.id);
    }
}

/// `ARM Generic Timer` counter frequency feeding `vtimer`'s host-side arming
/// math. A free function rather than a `Vcpu` method: it reads a per-pCPU
/// system register, not per-vCPU state.
#[cfg(target_arch = "aarch64")]
fn guest_timer_freq_hz() -> u64 {
    crate::arch::aarch64::peripherals::timer::get_frequency()
}

#[cfg(not(target_arch = "aarch64"))]
fn guest_timer_freq_hz() -> u64 {
    0
}

/// Wire `vtimer`'s guest-notification seam to the real vgic/scheduler. Called
/// once at boot, before any vCPU's first `run()`.
pub fn register_vtimer_hooks() {
    vtimer::register_hooks(send_virq_to_vcpu, wake_vcpu_by_id, clear_pending_virq_for_vcpu);
}

fn send_virq_to_vcpu(vcpu_id: usize, virq: u32) {
    vgic::request_virq_for(vcpu_id, virq, false, 0, 0xA0);
}

fn wake_vcpu_by_id(vcpu_id: usize) {
    crate::scheduler::wake_up(vcpu_id as crate::task::Tid, crate::task::PendStat::Ok);
}

fn clear_pending_virq_for_vcpu(vcpu_id: usize, virq: u32) {
    vgic::clear_software_pending_for(vcpu_id, virq);
}

impl core::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("pc", &format_args!("0x{:016x}", self.context.pc))
            .field("sp", &format_args!("0x{:016x}", self.context.sp))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_vcpu_starts_ready_in_root_mode() {
        let vcpu = Vcpu::new(1, 0x4000_0000, 0x5000_0000);
        assert_eq!(vcpu.state(), VcpuState::Ready);
        assert_eq!(vcpu.mode(), VcpuMode::InRoot);
        vgic::remove_context(1);
    }

    #[test]
    fn stop_tears_down_the_vgic_context() {
        let mut vcpu = Vcpu::new(2, 0, 0);
        vcpu.stop();
        assert_eq!(vcpu.state(), VcpuState::Stopped);
        // the context slot is gone; requesting a virq against it is a no-op
        vgic::request_virq_for(2, 32, false, 0, 0xA0);
    }

    #[test]
    fn reset_returns_to_ready_and_reinstalls_the_vgic_context() {
        let mut vcpu = Vcpu::new(3, 0, 0);
        vcpu.stop();
        vcpu.reset(0x1000, 0x2000);
        assert_eq!(vcpu.state(), VcpuState::Ready);
        assert_eq!(vcpu.mode(), VcpuMode::InRoot);
        vgic::request_virq_for(3, 32, false, 0, 0xA0);
        vgic::remove_context(3);
    }
}
