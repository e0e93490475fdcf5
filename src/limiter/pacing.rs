use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// A granted dispatch instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingSlot {
    pub at: Instant,
    previous: Option<Instant>,
}

/// Serializes dispatch instants so that no two granted slots are closer than the
/// configured spacing. Grants are handed out in the order callers reach the lock.
#[derive(Debug, Default)]
pub struct PacingClock {
    last_granted: Mutex<Option<Instant>>,
}

impl PacingClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the earliest slot `>= not_before` that is at least `spacing` after the
    /// previous grant. Returns `None`, reserving nothing, when that slot would land after
    /// `deadline`.
    pub fn next_slot(
        &self,
        spacing: Duration,
        not_before: Instant,
        deadline: Option<Instant>,
    ) -> Option<PacingSlot> {
        let mut last = self.last_granted.lock();
        let at = match *last {
            Some(prev) => not_before.max(prev + spacing),
            None => not_before,
        };

        if let Some(deadline) = deadline {
            if at > deadline {
                return None;
            }
        }

        let slot = PacingSlot { at, previous: *last };
        *last = Some(at);
        Some(slot)
    }

    /// Takes a slot back if nobody has been granted a later one since.
    pub fn cancel(&self, slot: PacingSlot) -> bool {
        let mut last = self.last_granted.lock();
        if *last == Some(slot.at) {
            *last = slot.previous;
            true
        } else {
            false
        }
    }

    pub fn last_granted(&self) -> Option<Instant> {
        *self.last_granted.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[tokio::test(start_paused = true)]
    async fn test_slots_spaced() {
        let clock = PacingClock::new();
        let spacing = Duration::from_millis(15);
        let now = Instant::now();

        let a = clock.next_slot(spacing, now, None).unwrap();
        let b = clock.next_slot(spacing, now, None).unwrap();
        let c = clock.next_slot(spacing, now, None).unwrap();

        assert_eq!(a.at, now);
        assert_eq!(b.at, now + spacing);
        assert_eq!(c.at, now + spacing * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_clock_grants_immediately() {
        let clock = PacingClock::new();
        let spacing = Duration::from_millis(15);
        let now = Instant::now();

        clock.next_slot(spacing, now, None).unwrap();
        let later = now + Duration::from_secs(1);
        assert_eq!(clock.next_slot(spacing, later, None).unwrap().at, later);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reserves_nothing() {
        let clock = PacingClock::new();
        let spacing = Duration::from_millis(100);
        let now = Instant::now();

        let first = clock.next_slot(spacing, now, None).unwrap();
        assert!(clock
            .next_slot(spacing, now, Some(now + Duration::from_millis(50)))
            .is_none());
        assert_eq!(clock.last_granted(), Some(first.at));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_only_latest() {
        let clock = PacingClock::new();
        let spacing = Duration::from_millis(10);
        let now = Instant::now();

        let a = clock.next_slot(spacing, now, None).unwrap();
        let b = clock.next_slot(spacing, now, None).unwrap();

        assert!(!clock.cancel(a));
        assert!(clock.cancel(b));
        assert_eq!(clock.last_granted(), Some(a.at));

        let c = clock.next_slot(spacing, now, None).unwrap();
        assert_eq!(c.at, b.at);
    }

    #[test]
    fn test_concurrent_grants_never_closer_than_spacing() {
        let clock = Arc::new(PacingClock::new());
        let spacing = Duration::from_millis(15);
        let now = Instant::now();
        let mut handles = vec![];

        for _ in 0..8 {
            let clock = clock.clone();
            handles.push(thread::spawn(move || {
                (0..50)
                    .map(|_| clock.next_slot(spacing, now, None).unwrap().at)
                    .collect::<Vec<_>>()
            }));
        }

        let mut slots: Vec<Instant> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        slots.sort();
        assert_eq!(slots.len(), 400);
        for pair in slots.windows(2) {
            assert!(pair[1] - pair[0] >= spacing);
        }
    }
}
