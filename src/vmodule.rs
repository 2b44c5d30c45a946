//! Fixed-capacity hook-chain registration points (component I, a supplemented
//! ambient-stack feature).
//!
//! Grounded on the `register_hook(fn, OS_HOOK_*)`/`do_hooks(item, data,
//! OS_HOOK_*)` pattern visible in `original_source/kernel/virt/virq_chips/vgic.c`
//! (`register_hook(virq_chip_vcpu_init, OS_HOOK_VCPU_INIT)`) and its call
//! sites in `original_source/kernel/virt/vm.c`/`core/task.c`
//! (`OS_HOOK_ENTER_TO_GUEST`/`OS_HOOK_EXIT_FROM_GUEST`/`OS_HOOK_CREATE_VM`/
//! `OS_HOOK_DESTROY_VM`/`OS_HOOK_VCPU_INIT`/`OS_HOOK_SETUP_VM`/
//! `OS_HOOK_CREATE_TASK`). The original's hook chain is a generic
//! `list_head` of `void *` callbacks shared across every hook point; this
//! crate instead gives each point its own fixed-capacity array of a
//! concretely-typed `fn`, since a `no_std`/no-`alloc` build can't express the
//! original's single polymorphic registration list without type erasure.
//! `vtimer.rs`'s `register_hooks` predates this module and plays the same
//! role for its own three callbacks; this module is the general form for
//! every other hook point that needs more than one subscriber.

use crate::sync::SpinLock;
use crate::task::Tid;

const MAX_HOOKS_PER_POINT: usize = 4;

struct HookChain<F: Copy> {
    hooks: [Option<F>; MAX_HOOKS_PER_POINT],
}

impl<F: Copy> HookChain<F> {
    const fn new() -> Self {
        Self { hooks: [None; MAX_HOOKS_PER_POINT] }
    }

    fn register(&mut self, f: F) {
        for slot in self.hooks.iter_mut() {
            if slot.is_none() {
                *slot = Some(f);
                return;
            }
        }
        panic!("vmodule: hook chain full");
    }
}

pub type VcpuHook = fn(vcpu_id: usize);
pub type VmHook = fn(vmid: usize);
pub type TaskHook = fn(tid: Tid);

struct Hooks {
    enter_to_guest: HookChain<VcpuHook>,
    exit_from_guest: HookChain<VcpuHook>,
    vcpu_init: HookChain<VcpuHook>,
    create_vm: HookChain<VmHook>,
    destroy_vm: HookChain<VmHook>,
    setup_vm: HookChain<VmHook>,
    create_task: HookChain<TaskHook>,
}

impl Hooks {
    const fn new() -> Self {
        Self {
            enter_to_guest: HookChain::new(),
            exit_from_guest: HookChain::new(),
            vcpu_init: HookChain::new(),
            create_vm: HookChain::new(),
            destroy_vm: HookChain::new(),
            setup_vm: HookChain::new(),
            create_task: HookChain::new(),
        }
    }
}

static HOOKS: SpinLock<Hooks> = SpinLock::new(Hooks::new());

pub fn register_enter_to_guest(f: VcpuHook) {
    HOOKS.lock().enter_to_guest.register(f);
}

pub fn register_exit_from_guest(f: VcpuHook) {
    HOOKS.lock().exit_from_guest.register(f);
}

pub fn register_vcpu_init(f: VcpuHook) {
    HOOKS.lock().vcpu_init.register(f);
}

pub fn register_create_vm(f: VmHook) {
    HOOKS.lock().create_vm.register(f);
}

pub fn register_destroy_vm(f: VmHook) {
    HOOKS.lock().destroy_vm.register(f);
}

pub fn register_setup_vm(f: VmHook) {
    HOOKS.lock().setup_vm.register(f);
}

pub fn register_create_task(f: TaskHook) {
    HOOKS.lock().create_task.register(f);
}

/// `do_hooks(vcpu, regs, OS_HOOK_ENTER_TO_GUEST)`.
pub fn run_enter_to_guest(vcpu_id: usize) {
    let h = HOOKS.lock();
    for f in h.enter_to_guest.hooks.iter().flatten() {
        f(vcpu_id);
    }
}

/// `do_hooks(vcpu, regs, OS_HOOK_EXIT_FROM_GUEST)`.
pub fn run_exit_from_guest(vcpu_id: usize) {
    let h = HOOKS.lock();
    for f in h.exit_from_guest.hooks.iter().flatten() {
        f(vcpu_id);
    }
}

/// `do_hooks(vcpu, NULL, OS_HOOK_VCPU_INIT)`.
pub fn run_vcpu_init(vcpu_id: usize) {
    let h = HOOKS.lock();
    for f in h.vcpu_init.hooks.iter().flatten() {
        f(vcpu_id);
    }
}

/// `do_hooks(vm, NULL, OS_HOOK_CREATE_VM)`.
pub fn run_create_vm(vmid: usize) {
    let h = HOOKS.lock();
    for f in h.create_vm.hooks.iter().flatten() {
        f(vmid);
    }
}

/// `do_hooks(vm, NULL, OS_HOOK_DESTROY_VM)`.
pub fn run_destroy_vm(vmid: usize) {
    let h = HOOKS.lock();
    for f in h.destroy_vm.hooks.iter().flatten() {
        f(vmid);
    }
}

/// `do_hooks(vm, NULL, OS_HOOK_SETUP_VM)`.
pub fn run_setup_vm(vmid: usize) {
    let h = HOOKS.lock();
    for f in h.setup_vm.hooks.iter().flatten() {
        f(vmid);
    }
}

/// `do_hooks(task, NULL, OS_HOOK_CREATE_TASK)`.
pub fn run_create_task(tid: Tid) {
    let h = HOOKS.lock();
    for f in h.create_task.hooks.iter().flatten() {
        f(tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static SEEN: AtomicUsize = AtomicUsize::new(0);
    fn observer(vcpu_id: usize) {
        SEEN.store(vcpu_id, Ordering::Relaxed);
    }

    #[test]
    fn registered_hook_runs_on_enter_to_guest() {
        register_enter_to_guest(observer);
        run_enter_to_guest(7);
        assert_eq!(SEEN.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn chain_fills_to_capacity() {
        let mut chain: HookChain<VcpuHook> = HookChain::new();
        for _ in 0..MAX_HOOKS_PER_POINT {
            chain.register(observer);
        }
        assert!(chain.hooks.iter().all(|h| h.is_some()));
    }
}
