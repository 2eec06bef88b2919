//! Task table and the SCHED_OTHER / SCHED_DEADLINE policy switch (spec
//! §4.10). `pick_next` replaces the teacher's flat round-robin
//! (`threading.rs::schedule_indices`) with: service deadline-task period
//! rollovers and miss handling, then EDF among ready deadline tasks, then
//! priority round-robin among SCHED_OTHER tasks.

use alloc::vec::Vec;

use super::deadline::{self, BandwidthLedger, DeadlineParams};
use super::{Context, SchedPolicy, SpawnError, Task, TaskState};
use crate::config::MAX_THREADS;

pub struct Scheduler {
    tasks: Vec<Task>,
    current_idx: usize,
    bandwidth: BandwidthLedger,
}

impl Scheduler {
    pub fn new() -> Self {
        let idle = Task::new_idle();
        let mut tasks = Vec::new();
        tasks.push(idle);
        tasks.reserve(MAX_THREADS - 1);
        Self {
            tasks,
            current_idx: 0,
            bandwidth: BandwidthLedger::new(),
        }
    }

    pub fn next_id(&self) -> usize {
        self.tasks.len()
    }

    pub fn add(&mut self, task: Task) -> Result<usize, SpawnError> {
        if self.tasks.len() >= MAX_THREADS {
            return Err(SpawnError::TooManyTasks);
        }
        let id = task.id;
        self.tasks.push(task);
        Ok(id)
    }

    pub fn admit_deadline_bandwidth(&mut self, params: &DeadlineParams) -> Result<(), SpawnError> {
        self.bandwidth
            .admit(params)
            .map_err(|_| SpawnError::BandwidthExceeded)
    }

    pub fn current_task_id(&self) -> usize {
        self.tasks[self.current_idx].id
    }

    pub fn task_mut(&mut self, id: usize) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn task(&self, id: usize) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn mark_current_terminated(&mut self) {
        let idx = self.current_idx;
        self.tasks[idx].state = TaskState::Terminated;
        if let Some(params) = self.tasks[idx].deadline.take() {
            self.bandwidth.release(&params);
        }
    }

    /// # Safety
    /// Caller must not alias the returned pointers across the switch.
    pub unsafe fn context_ptrs(&mut self, old_idx: usize, new_idx: usize) -> (*mut Context, *const Context) {
        let old_ptr = &mut self.tasks[old_idx].context as *mut Context;
        let new_ptr = &self.tasks[new_idx].context as *const Context;
        (old_ptr, new_ptr)
    }

    /// Service deadline-task period rollovers/misses, then pick the next
    /// task to run: EDF among ready `Deadline` tasks, else priority
    /// round-robin among ready `Other` tasks, else stay put.
    pub fn pick_next(&mut self, now_us: u64) -> Option<(usize, usize)> {
        if self.tasks.len() <= 1 {
            return None;
        }

        for task in self.tasks.iter_mut() {
            if task.policy != SchedPolicy::Deadline || task.state == TaskState::Terminated {
                continue;
            }
            let Some(params) = task.deadline.as_mut() else {
                continue;
            };
            if params.next_release == 0 || now_us >= params.next_release + params.period_us {
                params.replenish(now_us);
            }
            if params.is_missed(now_us) {
                let policy = params.miss_policy;
                let demote = deadline::handle_deadline_miss(params, policy);
                if demote {
                    task.policy = SchedPolicy::Other;
                    if let Some(p) = task.deadline.take() {
                        self.bandwidth.release(&p);
                    }
                }
            }
        }

        let current_idx = self.current_idx;

        let edf_pick = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                t.policy == SchedPolicy::Deadline
                    && matches!(t.state, TaskState::Ready | TaskState::Running)
                    && t.deadline.map(|d| d.remaining_runtime_us > 0).unwrap_or(false)
            })
            .min_by_key(|(_, t)| t.deadline.unwrap().absolute_deadline())
            .map(|(idx, _)| idx);

        let next_idx = match edf_pick {
            Some(idx) => idx,
            None => self.pick_other(current_idx),
        };

        if next_idx == current_idx {
            return None;
        }

        if self.tasks[current_idx].state != TaskState::Terminated {
            self.tasks[current_idx].state = TaskState::Ready;
        }
        self.tasks[next_idx].state = TaskState::Running;
        self.current_idx = next_idx;
        Some((current_idx, next_idx))
    }

    /// Round-robin among ready SCHED_OTHER tasks, preferring the lowest
    /// `effective_prio` value seen in the scan.
    fn pick_other(&self, current_idx: usize) -> usize {
        let thread_count = self.tasks.len();
        let mut best: Option<usize> = None;
        for offset in 1..=thread_count {
            let idx = (current_idx + offset) % thread_count;
            if idx == 0 {
                continue;
            }
            let t = &self.tasks[idx];
            if t.policy != SchedPolicy::Other || !matches!(t.state, TaskState::Ready | TaskState::Running) {
                continue;
            }
            best = match best {
                None => Some(idx),
                Some(b) if t.effective_prio() < self.tasks[b].effective_prio() => Some(idx),
                Some(b) => Some(b),
            };
        }
        best.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn dummy() -> ! {
        loop {}
    }

    #[test]
    fn edf_picks_earliest_absolute_deadline() {
        let mut sched = Scheduler::new();
        let mut a = Task::new(sched.next_id(), dummy, 4096);
        a.policy = SchedPolicy::Deadline;
        let mut pa = DeadlineParams::new(100, 500, 1000);
        pa.replenish(0);
        a.deadline = Some(pa);
        sched.add(a).unwrap();

        let mut b = Task::new(sched.next_id(), dummy, 4096);
        b.policy = SchedPolicy::Deadline;
        let mut pb = DeadlineParams::new(100, 200, 1000);
        pb.replenish(0);
        b.deadline = Some(pb);
        sched.add(b).unwrap();

        let switched = sched.pick_next(10).expect("should switch");
        assert_eq!(switched.1, 2); // task b has the nearer deadline (200 < 500)
    }

    #[test]
    fn pick_next_honors_per_task_throttle_policy() {
        let mut sched = Scheduler::new();
        let mut a = Task::new(sched.next_id(), dummy, 4096);
        a.policy = SchedPolicy::Deadline;
        let mut pa = DeadlineParams::new(100, 200, 500).with_miss_policy(deadline::MissPolicy::ThrottleOnMiss);
        pa.replenish(0);
        a.deadline = Some(pa);
        sched.add(a).unwrap();

        // now_us is past the deadline (200) but still within the period
        // (500), so this is a miss. With its own ThrottleOnMiss the task
        // must stay in SCHED_DEADLINE regardless of miss_count.
        sched.pick_next(250);

        assert_eq!(sched.task(1).unwrap().policy, SchedPolicy::Deadline);
        assert_eq!(sched.task(1).unwrap().deadline.unwrap().miss_count, 1);
    }

    #[test]
    fn other_round_robins_among_equal_priority() {
        let mut sched = Scheduler::new();
        sched.add(Task::new(sched.next_id(), dummy, 4096)).unwrap();
        sched.add(Task::new(sched.next_id(), dummy, 4096)).unwrap();

        let first = sched.pick_next(0).expect("switch to task 1");
        assert_eq!(first.1, 1);
        let second = sched.pick_next(0).expect("switch to task 2");
        assert_eq!(second.1, 2);
    }

    #[test]
    fn other_prefers_lower_priority_value() {
        let mut sched = Scheduler::new();
        let mut low_prio = Task::new(sched.next_id(), dummy, 4096);
        low_prio.base_prio = 200;
        sched.add(low_prio).unwrap();

        let mut high_prio = Task::new(sched.next_id(), dummy, 4096);
        high_prio.base_prio = 10;
        sched.add(high_prio).unwrap();

        let switched = sched.pick_next(0).expect("switch");
        assert_eq!(switched.1, 2); // the prio=10 task, despite being added second
    }
}
