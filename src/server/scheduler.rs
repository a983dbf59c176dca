//! Cooperative client scheduler
//!
//! Picks which ready client runs next and for how long. Clients are ranked by
//! explicit priority, then by a smart priority that decays while a client
//! keeps using whole slices and recovers while it sits idle, then by how long
//! ago each was last chosen. A server grab parks every other ready client in
//! a side queue until the grab is released.

use crate::config::SchedulerConfig;
use crate::protocol::ClientId;
use log::trace;
use std::cmp::Reverse;
use std::collections::VecDeque;

pub const SMART_MAX_PRIORITY: i32 = 20;
pub const SMART_MIN_PRIORITY: i32 = -20;

/// Requests a client may run per turn when smart scheduling is off
pub const DUMB_REQUESTS_PER_TURN: u32 = 10;

#[derive(Debug, Clone, Copy, Default)]
struct SchedState {
    priority: i32,
    smart_priority: i32,
    /// Pick counter value when last chosen; 0 = never
    last_chosen: u64,
    /// Time the client last finished a turn
    stop_tick: u64,
}

impl SchedState {
    /// Ordering key: higher wins, least recently chosen breaks ties
    fn rank(&self) -> (i32, i32, Reverse<u64>) {
        (self.priority, self.smart_priority, Reverse(self.last_chosen))
    }
}

#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    states: Vec<Option<SchedState>>,
    ready: VecDeque<ClientId>,
    saved_ready: VecDeque<ClientId>,
    grab: Option<ClientId>,
    slice_ms: u64,
    picks: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Scheduler {
            config,
            states: Vec::new(),
            ready: VecDeque::new(),
            saved_ready: VecDeque::new(),
            grab: None,
            slice_ms: config.interval_ms,
            picks: 0,
        }
    }

    pub fn add_client(&mut self, id: ClientId, now_ms: u64) {
        let index = id.index();
        if self.states.len() <= index {
            self.states.resize(index + 1, None);
        }
        self.states[index] = Some(SchedState {
            stop_tick: now_ms,
            ..SchedState::default()
        });
    }

    /// Forget a client entirely, including any queue membership
    pub fn remove_client(&mut self, id: ClientId) {
        self.ready.retain(|c| *c != id);
        self.saved_ready.retain(|c| *c != id);
        if let Some(slot) = self.states.get_mut(id.index()) {
            *slot = None;
        }
    }

    fn state(&self, id: ClientId) -> Option<&SchedState> {
        self.states.get(id.index()).and_then(Option::as_ref)
    }

    fn state_mut(&mut self, id: ClientId) -> Option<&mut SchedState> {
        self.states.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn set_priority(&mut self, id: ClientId, priority: i32) {
        if let Some(state) = self.state_mut(id) {
            state.priority = priority.clamp(SMART_MIN_PRIORITY, SMART_MAX_PRIORITY);
        }
    }

    pub fn smart_priority(&self, id: ClientId) -> Option<i32> {
        self.state(id).map(|s| s.smart_priority)
    }

    /// Current slice length in milliseconds
    pub fn slice_ms(&self) -> u64 {
        self.slice_ms
    }

    /// The client has input to process. While another client holds the grab
    /// it is parked instead of queued.
    pub fn mark_ready(&mut self, id: ClientId) {
        if self.state(id).is_none() {
            return;
        }
        let queue = match self.grab {
            Some(holder) if holder != id => &mut self.saved_ready,
            _ => &mut self.ready,
        };
        if !queue.contains(&id) {
            queue.push_back(id);
        }
    }

    /// The client has nothing complete left to run
    pub fn clear_ready(&mut self, id: ClientId) {
        self.ready.retain(|c| *c != id);
    }

    pub fn is_ready(&self, id: ClientId) -> bool {
        self.ready.contains(&id)
    }

    pub fn is_parked(&self, id: ClientId) -> bool {
        self.saved_ready.contains(&id)
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn grabbed_by(&self) -> Option<ClientId> {
        self.grab
    }

    /// Give `id` the server grab and park every other ready client
    pub fn grab(&mut self, id: ClientId) {
        self.grab = Some(id);
        let (keep, park): (VecDeque<ClientId>, VecDeque<ClientId>) =
            self.ready.drain(..).partition(|c| *c == id);
        self.ready = keep;
        self.saved_ready.extend(park);
        trace!(
            "{} grabbed the server, {} client(s) parked",
            id,
            self.saved_ready.len()
        );
    }

    /// Release the grab and requeue parked clients in the order they arrived
    pub fn ungrab(&mut self) -> Option<ClientId> {
        let holder = self.grab.take()?;
        while let Some(id) = self.saved_ready.pop_front() {
            if !self.ready.contains(&id) {
                self.ready.push_back(id);
            }
        }
        trace!("{} released the server grab", holder);
        Some(holder)
    }

    /// Choose the next client to run and size its slice
    pub fn pick(&mut self, now_ms: u64) -> Option<ClientId> {
        if self.ready.is_empty() {
            return None;
        }
        let idle = 2 * self.slice_ms;
        let smart = !self.config.disabled;

        let mut best: Option<(ClientId, SchedState)> = None;
        for &id in &self.ready {
            let Some(state) = self.states.get_mut(id.index()).and_then(Option::as_mut) else {
                continue;
            };
            // Praise clients which haven't run in a while
            if smart
                && now_ms.saturating_sub(state.stop_tick) >= idle
                && state.smart_priority < 0
            {
                state.smart_priority += 1;
            }
            let candidate = *state;
            best = match best {
                None => Some((id, candidate)),
                Some((best_id, b)) => {
                    let better = if smart {
                        candidate.rank() > b.rank()
                    } else {
                        candidate.last_chosen < b.last_chosen
                    };
                    if better {
                        Some((id, candidate))
                    } else {
                        Some((best_id, b))
                    }
                }
            };
        }
        let (chosen, _) = best?;

        self.picks += 1;
        let nready = self.ready.len();
        let picks = self.picks;
        if let Some(state) = self.state_mut(chosen) {
            state.last_chosen = picks;
        }

        // Grow the slice while one client runs alone, shrink it back on contention
        if nready == 1 {
            self.slice_ms = (self.slice_ms + self.config.interval_ms).min(self.config.max_slice_ms);
        } else {
            self.slice_ms = self.config.interval_ms;
        }
        trace!(
            "Scheduled {} ({} ready, slice {}ms)",
            chosen,
            nready,
            self.slice_ms
        );
        Some(chosen)
    }

    /// Whether a turn that began at `start_ms` and has run `requests`
    /// requests must yield
    pub fn should_yield(&self, start_ms: u64, now_ms: u64, requests: u32) -> bool {
        if self.config.disabled {
            requests >= DUMB_REQUESTS_PER_TURN
        } else {
            now_ms.saturating_sub(start_ms) >= self.slice_ms
        }
    }

    /// Record the end of a turn. A client that had to be cut off at the end
    /// of its slice loses smart priority.
    pub fn end_turn(&mut self, id: ClientId, now_ms: u64, used_full_slice: bool) {
        let smart = !self.config.disabled;
        if let Some(state) = self.state_mut(id) {
            if smart && used_full_slice && state.smart_priority > SMART_MIN_PRIORITY {
                state.smart_priority -= 1;
            }
            state.stop_tick = now_ms;
        }
    }

    /// Drop all queues and grab state, keeping the configuration
    pub fn reset(&mut self) {
        *self = Scheduler::new(self.config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(clients: u16) -> Scheduler {
        let mut sched = Scheduler::new(SchedulerConfig::default());
        for i in 1..=clients {
            sched.add_client(ClientId(i), 0);
            sched.mark_ready(ClientId(i));
        }
        sched
    }

    #[test]
    fn test_every_ready_client_runs_within_n_rounds() {
        let mut sched = scheduler(5);
        let mut seen = Vec::new();
        for _ in 0..5 {
            let id = sched.pick(0).unwrap();
            assert!(!seen.contains(&id), "{} picked twice", id);
            seen.push(id);
            sched.end_turn(id, 0, false);
        }
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_hog_loses_smart_priority_and_recovers() {
        let mut sched = scheduler(2);
        let hog = ClientId(1);
        for _ in 0..3 {
            sched.end_turn(hog, 0, true);
        }
        assert_eq!(sched.smart_priority(hog), Some(-3));

        // the other client wins despite the hog having waited longer
        sched.state_mut(ClientId(2)).unwrap().last_chosen = 10;
        assert_eq!(sched.pick(0), Some(ClientId(2)));

        // idle for more than two slices: praised one step
        let later = 10 * sched.slice_ms();
        sched.pick(later);
        assert_eq!(sched.smart_priority(hog), Some(-2));
    }

    #[test]
    fn test_smart_priority_is_bounded() {
        let mut sched = scheduler(1);
        for _ in 0..100 {
            sched.end_turn(ClientId(1), 0, true);
        }
        assert_eq!(sched.smart_priority(ClientId(1)), Some(SMART_MIN_PRIORITY));
    }

    #[test]
    fn test_explicit_priority_wins() {
        let mut sched = scheduler(3);
        sched.set_priority(ClientId(3), 1);
        assert_eq!(sched.pick(0), Some(ClientId(3)));
    }

    #[test]
    fn test_slice_grows_only_without_contention() {
        let config = SchedulerConfig::default();
        let mut sched = scheduler(1);
        sched.pick(0);
        assert_eq!(sched.slice_ms(), 2 * config.interval_ms);
        for _ in 0..100 {
            sched.pick(0);
        }
        assert_eq!(sched.slice_ms(), config.max_slice_ms);

        sched.add_client(ClientId(2), 0);
        sched.mark_ready(ClientId(2));
        sched.pick(0);
        assert_eq!(sched.slice_ms(), config.interval_ms);
    }

    #[test]
    fn test_grab_parks_and_restores_order() {
        let mut sched = scheduler(4);
        sched.grab(ClientId(2));
        assert!(sched.is_ready(ClientId(2)));
        assert!(sched.is_parked(ClientId(1)));
        assert!(sched.is_parked(ClientId(4)));

        for _ in 0..3 {
            assert_eq!(sched.pick(0), Some(ClientId(2)));
        }
        // arriving input while grabbed is parked too
        sched.clear_ready(ClientId(2));
        sched.mark_ready(ClientId(3));
        assert!(!sched.has_ready());

        assert_eq!(sched.ungrab(), Some(ClientId(2)));
        let order: Vec<ClientId> = sched.ready.iter().copied().collect();
        assert_eq!(order, vec![ClientId(1), ClientId(3), ClientId(4)]);
    }

    #[test]
    fn test_dumb_scheduler_is_round_robin() {
        let mut sched = Scheduler::new(SchedulerConfig {
            disabled: true,
            ..SchedulerConfig::default()
        });
        for i in 1..=3 {
            sched.add_client(ClientId(i), 0);
            sched.mark_ready(ClientId(i));
        }
        sched.set_priority(ClientId(3), 10);
        let picks: Vec<ClientId> = (0..6).filter_map(|_| sched.pick(0)).collect();
        assert_eq!(
            picks,
            vec![1, 2, 3, 1, 2, 3].into_iter().map(ClientId).collect::<Vec<_>>()
        );
        assert!(!sched.should_yield(0, 1000, DUMB_REQUESTS_PER_TURN - 1));
        assert!(sched.should_yield(0, 0, DUMB_REQUESTS_PER_TURN));
    }
}
