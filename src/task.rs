//! Task descriptors and the global tid table.
//!
//! Grounded on `original_source/kernel/core/task.c`: `alloc_tid`/`release_tid`,
//! the `TASK_INFO_INIT` field set, and the RUNNING-vs-WAIT_EVENT/STARTUP branch
//! in `task_init()`. Intrusive list linkage is collapsed to a single `link`
//! index field per task (a task is either on a ready list or an event's
//! waiter list, never both), which keeps the ready-list/wait-list code free of
//! `alloc` while staying index-based the way the teacher's `percpu`/`global`
//! modules already favour raw arrays over pointer-chasing.

use crate::error::{HvError, HvResult};
use crate::flags::bitflags_like;
use crate::sync::SpinLock;

/// Compile-time ceiling on live tasks. The original ships a much larger
/// `OS_NR_TASKS`; this crate trims it to what the scheduler/event tests need.
pub const MAX_TASKS: usize = 64;
/// Lowest priority value; tasks at this priority are idle tasks.
pub const PRIO_IDLE: u8 = 7;
/// Number of distinct priority levels (0..=7).
pub const NUM_PRIORITIES: usize = 8;
/// Sentinel affinity meaning "any CPU may run this task".
pub const AFFINITY_ANY: u8 = 0xFF;

pub type Tid = u32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskState {
    New,
    Running,
    WaitEvent,
    Stopped,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PendStat {
    Ok,
    TimedOut,
    Aborted,
}

bitflags_like! {
    /// Task creation/behaviour flags.
    pub struct TaskFlags: u32 {
        const KERNEL        = 1 << 0;
        const DRIVER        = 1 << 1;
        const VCPU          = 1 << 2;
        const IDLE          = 1 << 3;
        const NO_AUTO_START = 1 << 4;
        const ROOT          = 1 << 5;
    }
}

/// A kernel task descriptor. Stacks and architectural context are intentionally
/// left as opaque handles here — they are supplied by `vcpu.rs`/arch glue for
/// vCPU-flavoured tasks, and by the host-side bump allocator (`mm::allocator`)
/// for kernel tasks.
pub struct Task {
    pub tid: Tid,
    pub pid: Option<u32>,
    pub priority: u8,
    pub affinity: u8,
    pub flags: TaskFlags,
    pub home_cpu: usize,
    pub state: TaskState,
    pub pend_stat: PendStat,
    pub wait_event: Option<usize>,
    /// Next task in whichever singly-linked list currently owns this task
    /// (a ready list, the stop list, or an event's waiter list).
    pub link: Option<Tid>,
    /// Delay in milliseconds armed by `event_task_wait`; `None` == infinite.
    pub delay_ms: Option<u64>,
    /// The `timer_wheel` slot armed for this wait's timeout, if any; stopped
    /// as soon as the task wakes for any other reason.
    pub timeout_handle: Option<crate::timer_wheel::TimerHandle>,
    pub in_use: bool,
    /// Incremented by `preempt_disable`/`do_not_preempt`; the scheduler may
    /// only be invoked on the zero-to-nonzero-to-zero balance point.
    pub preempt_count: u32,
    /// Strictly stronger than a plain preempt_disable: also inhibits
    /// NEED_RESCHED while held (see `do_not_preempt` in §4.C).
    pub no_preempt_count: u32,
    pub need_resched: bool,
}

impl Task {
    const fn empty() -> Self {
        Self {
            tid: 0,
            pid: None,
            priority: PRIO_IDLE,
            affinity: AFFINITY_ANY,
            flags: TaskFlags::empty(),
            home_cpu: 0,
            state: TaskState::New,
            pend_stat: PendStat::Ok,
            wait_event: None,
            link: None,
            delay_ms: None,
            timeout_handle: None,
            in_use: false,
            preempt_count: 0,
            no_preempt_count: 0,
            need_resched: false,
        }
    }
}

struct TaskTable {
    tasks: [Task; MAX_TASKS],
    tid_map: u64, // bit N set => tid N in use (MAX_TASKS <= 64)
}

impl TaskTable {
    const fn new() -> Self {
        Self {
            tasks: [const { Task::empty() }; MAX_TASKS],
            tid_map: 0,
        }
    }
}

static TID_LOCK: SpinLock<TaskTable> = SpinLock::new(TaskTable::new());

/// tid 0 is reserved (matches `tid_early_init`'s reservation of tid 0).
fn reserve_tid_zero(table: &mut TaskTable) {
    table.tid_map |= 1;
    table.tasks[0].in_use = true;
    table.tasks[0].tid = 0;
}

pub fn tid_early_init() {
    let mut table = TID_LOCK.lock();
    reserve_tid_zero(&mut table);
}

fn alloc_tid(table: &mut TaskTable) -> Option<Tid> {
    for i in 1..MAX_TASKS {
        if table.tid_map & (1 << i) == 0 {
            table.tid_map |= 1 << i;
            return Some(i as Tid);
        }
    }
    None
}

fn release_tid(table: &mut TaskTable, tid: Tid) {
    debug_assert!(tid != 0, "tid 0 is reserved and never released");
    table.tid_map &= !(1 << tid);
}

/// Validate and possibly fall back priority/affinity the way `__create_task`
/// does: affinity out of range collapses to ANY, invalid priority collapses
/// to the lowest runnable default (one above idle).
fn normalize_priority_affinity(priority: u8, affinity: u8, num_cpus: usize) -> (u8, u8) {
    let prio = if priority as usize >= NUM_PRIORITIES {
        PRIO_IDLE - 1
    } else {
        priority
    };
    let aff = if affinity != AFFINITY_ANY && affinity as usize >= num_cpus {
        AFFINITY_ANY
    } else {
        affinity
    };
    (prio, aff)
}

/// Create a task descriptor and install it (without inserting it into any
/// ready/wait list — the caller, `scheduler::spawn`, does that after
/// allocating the stack/context).
pub fn create_task(
    priority: u8,
    affinity: u8,
    flags: TaskFlags,
    pid: Option<u32>,
    num_cpus: usize,
    home_cpu: usize,
) -> HvResult<Tid> {
    let (priority, affinity) = normalize_priority_affinity(priority, affinity, num_cpus);
    let mut table = TID_LOCK.lock();
    let tid = alloc_tid(&mut table).ok_or(HvError::NoMemory)?;
    let idx = tid as usize;
    table.tasks[idx] = Task {
        tid,
        pid,
        priority,
        affinity,
        flags,
        home_cpu,
        state: if flags.contains(TaskFlags::VCPU) || flags.contains(TaskFlags::NO_AUTO_START) {
            TaskState::New
        } else {
            TaskState::Running
        },
        pend_stat: PendStat::Ok,
        wait_event: None,
        link: None,
        delay_ms: None,
        timeout_handle: None,
        in_use: true,
        preempt_count: 0,
        // DRV tasks start with preemption inhibited until they explicitly
        // opt back in, matching task_init()'s DRV -> __TIF_DONOT_PREEMPT.
        no_preempt_count: if flags.contains(TaskFlags::DRIVER) { 1 } else { 0 },
        need_resched: false,
    };
    Ok(tid)
}

pub fn do_release_task(tid: Tid) {
    let mut table = TID_LOCK.lock();
    debug_assert_eq!(table.tasks[tid as usize].state, TaskState::Stopped);
    table.tasks[tid as usize].in_use = false;
    release_tid(&mut table, tid);
}

/// Run `f` with exclusive access to a task's descriptor.
pub fn with_task<R>(tid: Tid, f: impl FnOnce(&mut Task) -> R) -> R {
    let mut table = TID_LOCK.lock();
    f(&mut table.tasks[tid as usize])
}

pub fn with_task_table<R>(f: impl FnOnce(&mut [Task; MAX_TASKS]) -> R) -> R {
    let mut table = TID_LOCK.lock();
    f(&mut table.tasks)
}
