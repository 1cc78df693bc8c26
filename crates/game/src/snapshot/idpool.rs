use std::time::{Duration, Instant};

pub const DEFAULT_ID_CAPACITY: usize = 16 * 1024;

/// How long a freed id stays quarantined before reuse. Clients may still
/// hold state for the old object under that id; reusing it earlier would
/// alias the two.
pub const DEFAULT_REUSE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdState {
    Free,
    Allocated,
    Timed,
}

#[derive(Debug, Clone, Copy)]
struct IdSlot {
    next: i32,
    state: IdState,
    timeout: Instant,
}

/// Fixed-size pool of small integer ids for transient networked objects.
/// Free ids form an intrusive list through `next`; freed ids sit in a
/// timed-release FIFO until their quarantine elapses.
#[derive(Debug)]
pub struct SnapIdPool {
    slots: Vec<IdSlot>,
    first_free: i32,
    first_timed: i32,
    last_timed: i32,
    usage: usize,
    in_usage: usize,
    reuse_delay: Duration,
}

impl SnapIdPool {
    pub fn new(capacity: usize, reuse_delay: Duration, now: Instant) -> Self {
        let mut pool = Self {
            slots: Vec::new(),
            first_free: -1,
            first_timed: -1,
            last_timed: -1,
            usage: 0,
            in_usage: 0,
            reuse_delay,
        };
        pool.slots = (0..capacity)
            .map(|i| IdSlot {
                next: if i + 1 < capacity { (i + 1) as i32 } else { -1 },
                state: IdState::Free,
                timeout: now,
            })
            .collect();
        pool.first_free = if capacity > 0 { 0 } else { -1 };
        pool
    }

    pub fn with_defaults(now: Instant) -> Self {
        Self::new(DEFAULT_ID_CAPACITY, DEFAULT_REUSE_DELAY, now)
    }

    pub fn reset(&mut self, now: Instant) {
        let capacity = self.slots.len();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.next = if i + 1 < capacity { (i + 1) as i32 } else { -1 };
            slot.state = IdState::Free;
            slot.timeout = now;
        }
        self.first_free = if capacity > 0 { 0 } else { -1 };
        self.first_timed = -1;
        self.last_timed = -1;
        self.usage = 0;
        self.in_usage = 0;
    }

    /// Ids handed out and not yet back on the free list.
    pub fn usage(&self) -> usize {
        self.usage
    }

    /// Ids currently allocated (excludes the quarantine queue).
    pub fn in_usage(&self) -> usize {
        self.in_usage
    }

    fn remove_first_timeout(&mut self) {
        let first = self.first_timed as usize;
        let next_timed = self.slots[first].next;

        self.slots[first].next = self.first_free;
        self.slots[first].state = IdState::Free;
        self.first_free = self.first_timed;

        self.first_timed = next_timed;
        if self.first_timed == -1 {
            self.last_timed = -1;
        }
        self.usage -= 1;
    }

    /// Pops a fresh id. Exhaustion means the pool was sized wrong for the
    /// game; that is a configuration error, not a runtime condition.
    pub fn new_id(&mut self, now: Instant) -> i32 {
        while self.first_timed != -1 && self.slots[self.first_timed as usize].timeout <= now {
            self.remove_first_timeout();
        }

        let id = self.first_free;
        assert!(id != -1, "snapshot id pool exhausted");
        self.first_free = self.slots[id as usize].next;
        self.slots[id as usize].state = IdState::Allocated;
        self.usage += 1;
        self.in_usage += 1;
        id
    }

    /// Moves an id into quarantine; it becomes allocatable again once the
    /// reuse delay has elapsed.
    pub fn free_id(&mut self, id: i32, now: Instant) {
        if id < 0 {
            return;
        }
        let slot = &mut self.slots[id as usize];
        assert!(slot.state == IdState::Allocated, "id is not allocated");

        self.in_usage -= 1;
        slot.state = IdState::Timed;
        slot.timeout = now + self.reuse_delay;
        slot.next = -1;

        if self.last_timed != -1 {
            self.slots[self.last_timed as usize].next = id;
            self.last_timed = id;
        } else {
            self.first_timed = id;
            self.last_timed = id;
        }
    }

    /// Flushes the whole quarantine queue regardless of deadlines; used at
    /// world re-init when every client discards its state anyway.
    pub fn timeout_ids(&mut self) {
        while self.first_timed != -1 {
            self.remove_first_timeout();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freed_id_quarantined_until_delay() {
        let now = Instant::now();
        let mut pool = SnapIdPool::new(8, Duration::from_secs(5), now);

        let id = pool.new_id(now);
        pool.free_id(id, now);

        // drain the rest of the pool inside the quarantine window; the
        // freed id must not reappear
        for _ in 0..7 {
            let fresh = pool.new_id(now + Duration::from_secs(4));
            assert_ne!(fresh, id);
        }

        // after the delay it is allocatable again
        let reclaimed = pool.new_id(now + Duration::from_secs(6));
        assert_eq!(reclaimed, id);
    }

    #[test]
    fn test_quarantine_releases_in_free_order() {
        let now = Instant::now();
        let mut pool = SnapIdPool::new(4, Duration::from_secs(1), now);
        let a = pool.new_id(now);
        let b = pool.new_id(now);
        pool.free_id(a, now);
        pool.free_id(b, now + Duration::from_millis(100));

        // both quarantines expired; reclaimed ids land on the free-list
        // head, so the most recently released one pops first
        let later = now + Duration::from_secs(2);
        assert_eq!(pool.new_id(later), b);
        assert_eq!(pool.new_id(later), a);
    }

    #[test]
    #[should_panic(expected = "snapshot id pool exhausted")]
    fn test_exhaustion_panics() {
        let now = Instant::now();
        let mut pool = SnapIdPool::new(2, Duration::from_secs(5), now);
        pool.new_id(now);
        pool.new_id(now);
        pool.new_id(now);
    }

    #[test]
    fn test_timeout_ids_flushes_queue() {
        let now = Instant::now();
        let mut pool = SnapIdPool::new(2, Duration::from_secs(60), now);
        let a = pool.new_id(now);
        let b = pool.new_id(now);
        pool.free_id(a, now);
        pool.free_id(b, now);
        assert_eq!(pool.in_usage(), 0);
        assert_eq!(pool.usage(), 2);

        pool.timeout_ids();
        assert_eq!(pool.usage(), 0);
        // both immediately allocatable again
        pool.new_id(now);
        pool.new_id(now);
    }
}
