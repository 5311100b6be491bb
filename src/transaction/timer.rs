use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Instant,
};

/// Ordered by deadline, then by insertion.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
struct TimerKey {
    execute_at: Instant,
    task_id: u64,
}

impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.execute_at
            .cmp(&other.execute_at)
            .then(self.task_id.cmp(&other.task_id))
    }
}

impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Deadline queue. `poll` hands back every value whose deadline has passed,
/// earliest first.
pub struct Timer<T> {
    tasks: Mutex<BTreeMap<TimerKey, T>>,
    last_task_id: AtomicU64,
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            tasks: Mutex::new(BTreeMap::new()),
            last_task_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout_at(&self, execute_at: Instant, value: T) -> u64 {
        let task_id = self.last_task_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).insert(
            TimerKey {
                execute_at,
                task_id,
            },
            value,
        );
        task_id
    }

    pub fn clear(&self) {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let due = tasks
            .range(
                ..=TimerKey {
                    execute_at: now,
                    task_id: u64::MAX,
                },
            )
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();

        let mut result = Vec::with_capacity(due.len());
        for key in due {
            if let Some(value) = tasks.remove(&key) {
                result.push(value);
            }
        }
        result
    }
}

#[test]
fn test_timer() {
    use std::time::Duration;

    let timer = Timer::new();
    let now = Instant::now();
    assert_eq!(timer.timeout_at(now, "register"), 1);
    timer.clear();
    assert!(timer.is_empty());

    timer.timeout_at(now, "keepalive");
    timer.timeout_at(now, "catalog");
    let due = timer.poll(now + Duration::from_secs(1));
    assert_eq!(due, vec!["keepalive", "catalog"]);

    timer.timeout_at(now + Duration::from_millis(1001), "invite");
    assert!(timer.poll(now + Duration::from_secs(1)).is_empty());
    assert_eq!(timer.len(), 1);
    assert_eq!(timer.poll(now + Duration::from_secs(2)), vec!["invite"]);
    assert!(timer.is_empty());
}
