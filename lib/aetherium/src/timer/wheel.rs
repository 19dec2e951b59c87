//! Five-level cascading timing wheel, 10 ms granularity, Linux-kernel style. Owned exclusively
//! by the dispatcher thread: every mutation here happens from a single call site per tick plus
//! the insert/cancel calls made while processing `LOGIC_TIMER_ADD`/`LOGIC_TIMER_CANCEL` messages,
//! so the wheel itself carries no internal locking.
use hashbrown::HashMap;

pub(crate) const LEVEL_SIZES: [u64; 5] = [256, 64, 64, 64, 64];

fn period_for_level(level: usize) -> u64 {
    let mut period = 1u64;
    for size in LEVEL_SIZES.iter().take(level) {
        period *= size;
    }
    period
}

/// A scheduled entry. `interval_ticks == 0` means one-shot.
#[derive(Clone)]
pub(crate) struct TimerNode {
    pub(crate) expiry_tick: u64,
    pub(crate) interval_ticks: u64,
    pub(crate) cancelled: bool,
}

pub struct TimingWheel {
    buckets: [Vec<Vec<u64>>; 5],
    pub(crate) nodes: HashMap<u64, TimerNode>,
    current_tick: u64,
}

impl TimingWheel {
    pub fn new() -> Self {
        TimingWheel {
            buckets: [
                vec![Vec::new(); LEVEL_SIZES[0] as usize],
                vec![Vec::new(); LEVEL_SIZES[1] as usize],
                vec![Vec::new(); LEVEL_SIZES[2] as usize],
                vec![Vec::new(); LEVEL_SIZES[3] as usize],
                vec![Vec::new(); LEVEL_SIZES[4] as usize],
            ],
            nodes: HashMap::new(),
            current_tick: 0,
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    pub(crate) fn insert(&mut self, id: u64, node: TimerNode) {
        let (level, index) = self.locate(node.expiry_tick);
        self.buckets[level][index].push(id);
        self.nodes.insert(id, node);
    }

    pub(crate) fn cancel(&mut self, id: u64) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) => {
                node.cancelled = true;
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<TimerNode> {
        self.nodes.remove(&id)
    }

    fn locate(&self, expiry_tick: u64) -> (usize, usize) {
        let delta = expiry_tick.saturating_sub(self.current_tick);
        let mut floor = 0u64;
        for (level, &size) in LEVEL_SIZES.iter().enumerate() {
            let period = period_for_level(level);
            let span = period * size;
            if level == LEVEL_SIZES.len() - 1 || delta < floor + span {
                let index = ((expiry_tick / period) % size) as usize;
                return (level, index);
            }
            floor += span;
        }
        unreachable!("locate must resolve within the last wheel level")
    }

    /// Cascades one bucket down from coarser levels whenever the current tick crosses a level
    /// boundary, then pops and returns the ids that expire on this tick (excluding soft-cancelled
    /// ones, which are dropped here rather than fired).
    pub fn advance(&mut self) -> Vec<u64> {
        self.current_tick += 1;
        self.cascade(1);

        let idx0 = (self.current_tick % LEVEL_SIZES[0]) as usize;
        let slot = std::mem::take(&mut self.buckets[0][idx0]);

        let mut expired = Vec::with_capacity(slot.len());
        for id in slot {
            match self.nodes.get(&id) {
                Some(node) if !node.cancelled => expired.push(id),
                Some(_) => {
                    self.nodes.remove(&id);
                }
                None => {}
            }
        }
        expired
    }

    fn cascade(&mut self, level: usize) {
        if level >= LEVEL_SIZES.len() {
            return;
        }
        let period = period_for_level(level);
        if self.current_tick % period != 0 {
            return;
        }

        let size = LEVEL_SIZES[level];
        let index = ((self.current_tick / period) % size) as usize;
        let ids = std::mem::take(&mut self.buckets[level][index]);

        for id in ids {
            if let Some(node) = self.nodes.get(&id).cloned() {
                if node.cancelled {
                    self.nodes.remove(&id);
                    continue;
                }
                let (dest_level, dest_index) = self.locate(node.expiry_tick);
                self.buckets[dest_level][dest_index].push(id);
            }
        }

        if index == 0 {
            self.cascade(level + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(expiry_tick: u64) -> TimerNode {
        TimerNode {
            expiry_tick,
            interval_ticks: 0,
            cancelled: false,
        }
    }

    #[test]
    fn fires_on_the_exact_tick() {
        let mut wheel = TimingWheel::new();
        wheel.insert(1, node(5));

        let mut fired = None;
        for tick in 1..=5 {
            let expired = wheel.advance();
            if !expired.is_empty() {
                fired = Some(tick);
                assert_eq!(expired, vec![1]);
            }
        }
        assert_eq!(fired, Some(5));
    }

    #[test]
    fn cascades_a_far_future_timer_down_through_levels() {
        let mut wheel = TimingWheel::new();
        // Beyond level 0's 256-tick span, lands in level 1 initially and must cascade down.
        wheel.insert(1, node(300));

        let mut total_fired = 0;
        for _ in 0..300 {
            total_fired += wheel.advance().len();
        }
        assert_eq!(total_fired, 1);
    }

    #[test]
    fn cancelled_node_never_fires() {
        let mut wheel = TimingWheel::new();
        wheel.insert(1, node(10));
        wheel.cancel(1);

        let mut fired = 0;
        for _ in 0..20 {
            fired += wheel.advance().len();
        }
        assert_eq!(fired, 0);
    }

    #[test]
    fn many_simultaneous_timers_all_fire_in_order() {
        let mut wheel = TimingWheel::new();
        let delays = [5u64, 250, 2600, 16390];
        for (i, &d) in delays.iter().enumerate() {
            wheel.insert(i as u64, node(d));
        }

        let mut fire_ticks = vec![0u64; delays.len()];
        for tick in 1..=16390u64 {
            for id in wheel.advance() {
                fire_ticks[id as usize] = tick;
            }
        }

        for (i, &d) in delays.iter().enumerate() {
            assert_eq!(fire_ticks[i], d);
        }
    }
}
