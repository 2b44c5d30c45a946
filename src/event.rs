//! The generic wait-queue primitive (component D).
//!
//! Grounded on `original_source/kernel/core/event.c`: `event_get_waiter`,
//! `event_highest_task_ready`'s retry-on-racing-wake loop, `event_del_always`,
//! and `wait_event`'s pend_stat-to-return-code mapping.

use crate::scheduler;
use crate::sync::SpinLock;
use crate::task::{self, PendStat, TaskState, Tid};
use crate::timer_wheel;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
    Signal,
    Mailbox,
    Flag,
    Semaphore,
    Mutex,
    Poll,
    Timer,
    Startup,
    Endpoint,
    Reply,
    Irq,
    Futex,
}

const MAX_WAITERS: usize = task::MAX_TASKS;

struct WaitList {
    head: Option<Tid>,
    tail: Option<Tid>,
    /// Next-pointers kept alongside the task table so the event module does
    /// not need mutable access to `Task::link` while it's also in use by the
    /// scheduler's ready lists (a waiting task is never on a ready list).
    next: [Option<Tid>; MAX_WAITERS],
}

impl WaitList {
    const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            next: [None; MAX_WAITERS],
        }
    }

    fn push_back(&mut self, tid: Tid) {
        self.next[tid as usize] = None;
        match self.tail {
            Some(t) => {
                self.next[t as usize] = Some(tid);
                self.tail = Some(tid);
            }
            None => {
                self.head = Some(tid);
                self.tail = Some(tid);
            }
        }
    }

    fn pop_front(&mut self) -> Option<Tid> {
        let head = self.head?;
        let next = self.next[head as usize].take();
        self.head = next;
        if next.is_none() {
            self.tail = None;
        }
        Some(head)
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

struct EventInner {
    kind: EventKind,
    waiters: WaitList,
}

pub struct Event {
    inner: SpinLock<EventInner>,
}

impl Event {
    pub const fn new(kind: EventKind) -> Self {
        Self {
            inner: SpinLock::new(EventInner {
                kind,
                waiters: WaitList::new(),
            }),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.inner.lock().kind
    }

    /// `event_get_waiter`: pop the FIFO head under the event lock.
    pub fn get_waiter(&self) -> Option<Tid> {
        self.inner.lock().waiters.pop_front()
    }

    fn push_waiter(&self, tid: Tid) {
        self.inner.lock().waiters.push_back(tid);
    }

    /// `__event_task_wait` / `event_task_wait`: link the task onto the event,
    /// mark it WAIT_EVENT, and — if a delay was requested — arm a real
    /// `timer_wheel` timeout on the task's home CPU whose callback is
    /// `timeout_fire`. Must be called with preemption disabled by the caller
    /// (mirrors the original's precondition) — enforced here via
    /// `do_not_preempt`, released only once `sched()` (the scheduler giving
    /// up the CPU) has actually happened, which in this crate is the
    /// responsibility of the caller of `wait_event`. `now_ns` is the caller's
    /// current host time, threaded in explicitly the same way `vtimer.rs`
    /// takes `freq_hz`/`boot_tick` rather than reading the counter itself.
    pub fn task_wait(&self, tid: Tid, delay_ms: Option<u64>, now_ns: u64) {
        scheduler::do_not_preempt(tid);
        scheduler::forget_task(tid);
        task::with_task(tid, |t| {
            t.wait_event = Some(self as *const Event as usize);
            t.delay_ms = delay_ms;
            t.state = TaskState::WaitEvent;
        });
        if let Some(ms) = delay_ms {
            let cpu = task::with_task(tid, |t| t.home_cpu);
            let handle = timer_wheel::init_timer_on_cpu(cpu, timeout_fire, tid as usize);
            timer_wheel::mod_timer(handle, now_ns + ms * 1_000_000);
            task::with_task(tid, |t| t.timeout_handle = Some(handle));
        }
        self.push_waiter(tid);
    }

    /// `event_highest_task_ready`: pop waiters in FIFO order, attempt to wake
    /// each; if a wake loses the race (the waiter already transitioned, e.g.
    /// its timeout fired first), move on to the next waiter. Property 4/5.
    pub fn highest_task_ready(&self, pend_stat: PendStat) -> Option<Tid> {
        loop {
            let tid = self.get_waiter()?;
            if scheduler::wake_up(tid, pend_stat) {
                cancel_timeout(tid);
                return Some(tid);
            }
            // racing waiter already woke (e.g. by timeout) - try the next one
        }
    }

    /// `event_del_always`: abort every waiter, used only at teardown.
    pub fn del_always(&self) {
        while let Some(tid) = self.get_waiter() {
            if scheduler::wake_up(tid, PendStat::Aborted) {
                cancel_timeout(tid);
            }
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.inner.lock().waiters.is_empty()
    }
}

/// `wait_event(event, to)`: sleep on `ev` with an optional millisecond
/// timeout, returning the syscall-style result `{0, -ETIMEDOUT, -EABORT}`.
/// The caller is the currently-running task on its own CPU; `sched()` here
/// is represented abstractly as "give up the CPU and come back when woken",
/// which in this crate's cooperative test harness means the caller must not
/// resume until `scheduler::wake_up` has fired for this tid.
pub fn wait_event(ev: &Event, tid: Tid, timeout_ms: Option<u64>, now_ns: u64) -> i32 {
    ev.task_wait(tid, timeout_ms, now_ns);
    // scheduler handoff happens here in the real runtime (sched());
    // tests drive the wake/timeout race explicitly (including letting the
    // real timer_wheel fire) and then inspect pend_stat.
    let pend = task::with_task(tid, |t| t.pend_stat);
    scheduler::preempt_allowed_again(tid);
    match pend {
        PendStat::Ok => 0,
        PendStat::TimedOut => crate::error::HvError::TimedOut.as_errno(),
        PendStat::Aborted => crate::error::HvError::Aborted.as_errno(),
    }
}

/// `timer_wheel` callback for an armed `event_task_wait` delay: fires on the
/// waiter's home-cpu timer wheel once the timeout elapses.
fn timeout_fire(data: usize) {
    let tid = data as Tid;
    task::with_task(tid, |t| t.timeout_handle = None);
    scheduler::wake_up(tid, PendStat::TimedOut);
}

/// Stop a still-armed timeout once a waiter wakes for any other reason
/// (explicit signal or abort), so it never fires late against a task that
/// has moved on to something else.
fn cancel_timeout(tid: Tid) {
    let handle = task::with_task(tid, |t| t.timeout_handle.take());
    if let Some(h) = handle {
        timer_wheel::stop_timer(h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{tid_early_init, TaskFlags};

    fn spawn(prio: u8) -> Tid {
        task::create_task(prio, 0, TaskFlags::KERNEL, None, scheduler::MAX_CPUS, 0).unwrap()
    }

    #[test]
    fn fifo_wake_order() {
        tid_early_init();
        let ev = Event::new(EventKind::Signal);
        let v1 = spawn(3);
        let v2 = spawn(3);
        let v3 = spawn(3);
        ev.task_wait(v1, None, 0);
        ev.task_wait(v2, None, 0);
        ev.task_wait(v3, None, 0);

        assert_eq!(ev.highest_task_ready(PendStat::Ok), Some(v1));
        assert_eq!(ev.highest_task_ready(PendStat::Ok), Some(v2));
        assert_eq!(ev.highest_task_ready(PendStat::Ok), Some(v3));
        assert!(!ev.has_waiters());
    }

    #[test]
    fn wake_skips_already_timed_out_waiter() {
        tid_early_init();
        let ev = Event::new(EventKind::Signal);
        let v1 = spawn(3);
        let v2 = spawn(3);
        ev.task_wait(v1, Some(10), 0);
        ev.task_wait(v2, Some(10), 0);

        // let v1's real timer_wheel timeout actually fire first, racing ahead
        // of the explicit wake below
        let cpu = task::with_task(v1, |t| t.home_cpu);
        timer_wheel::run_expired(cpu, 10 * 1_000_000);

        // get_waiter() still returns v1 first (FIFO), but waking it now loses
        // the race, so highest_task_ready must skip to v2.
        assert_eq!(ev.highest_task_ready(PendStat::Ok), Some(v2));
        task::with_task(v1, |t| assert_eq!(t.pend_stat, PendStat::TimedOut));
        task::with_task(v2, |t| assert_eq!(t.pend_stat, PendStat::Ok));
        // v2 woke before its own timeout elapsed; its timer must be cancelled
        task::with_task(v2, |t| assert!(t.timeout_handle.is_none()));
    }

    #[test]
    fn wake_before_timeout_cancels_the_armed_timer() {
        tid_early_init();
        use core::sync::atomic::{AtomicUsize, Ordering};
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        fn mark(_data: usize) {
            FIRED.fetch_add(1, Ordering::Relaxed);
        }

        let ev = Event::new(EventKind::Signal);
        let v1 = spawn(3);
        ev.task_wait(v1, Some(10), 0);
        assert_eq!(ev.highest_task_ready(PendStat::Ok), Some(v1));

        // the wait's own timeout must no longer be armed: firing a decoy
        // timer on the same cpu must not touch v1's already-satisfied wait
        let cpu = task::with_task(v1, |t| t.home_cpu);
        timer_wheel::init_timer_on_cpu(cpu, mark, 0);
        timer_wheel::run_expired(cpu, 10 * 1_000_000);
        task::with_task(v1, |t| assert_eq!(t.pend_stat, PendStat::Ok));
    }

    #[test]
    fn del_always_aborts_everyone() {
        tid_early_init();
        let ev = Event::new(EventKind::Mutex);
        let v1 = spawn(2);
        let v2 = spawn(2);
        ev.task_wait(v1, None, 0);
        ev.task_wait(v2, None, 0);
        ev.del_always();
        task::with_task(v1, |t| assert_eq!(t.pend_stat, PendStat::Aborted));
        task::with_task(v2, |t| assert_eq!(t.pend_stat, PendStat::Aborted));
    }
}
