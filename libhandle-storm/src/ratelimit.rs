use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{
    num::NonZeroU32,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const MIN_SPACING: Duration = Duration::from_millis(1);

/// Floor for the sleep between claim attempts of a waiter.
const MIN_RECHECK: Duration = Duration::from_micros(200);

/// Spacing state shared between the router and every request waiting on the endpoint.
pub(crate) type SharedSpacing = Arc<Mutex<Spacing>>;

/// Minimum spacing between requests to one endpoint: a bucket holding a single token.
///
/// The quota period is the endpoint's adaptive delay, so changing the delay swaps
/// the underlying limiter. Requests that could not claim the slot at pick time are
/// counted in `queued`; each one claims a slot of its own later.
pub(crate) struct Spacing {
    limiter: Limiter,
    delay: Duration,
    clock: DefaultClock,
    queued: usize,
}

impl Spacing {
    pub fn new(delay: Duration) -> Self {
        let delay = delay.max(MIN_SPACING);
        Self {
            limiter: build(delay),
            delay,
            clock: DefaultClock::default(),
            queued: 0,
        }
    }

    pub fn shared(delay: Duration) -> SharedSpacing {
        Arc::new(Mutex::new(Self::new(delay)))
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Takes the slot if the spacing has elapsed, otherwise reports how long until it does.
    pub fn try_claim(&self) -> Result<(), Duration> {
        self.limiter
            .check()
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// Time until a new request would get its turn, behind everything already queued.
    ///
    /// `wait` is the time until the current slot frees.
    pub fn backlog(&self, wait: Duration) -> Duration {
        wait.saturating_add(
            self.delay
                .saturating_mul(u32::try_from(self.queued).unwrap_or(u32::MAX)),
        )
    }

    /// Replaces the delay. The fresh limiter starts with its slot taken so the next
    /// request still waits a full period, including requests already queued.
    pub fn set_delay(&mut self, delay: Duration) {
        let delay = delay.max(MIN_SPACING);
        if delay == self.delay {
            return;
        }
        let limiter = build(delay);
        let _ = limiter.check();
        self.limiter = limiter;
        self.delay = delay;
    }
}

pub(crate) fn lock(spacing: &SharedSpacing) -> MutexGuard<'_, Spacing> {
    spacing.lock().unwrap_or_else(|e| e.into_inner())
}

/// A request queued on an endpoint. Leaves the queue when dropped.
pub(crate) struct Waiter {
    spacing: SharedSpacing,
}

impl Waiter {
    pub fn enqueue(spacing: &SharedSpacing) -> Self {
        lock(spacing).queued += 1;
        Self {
            spacing: Arc::clone(spacing),
        }
    }

    /// Waits until a slot can be claimed.
    ///
    /// The limiter is re-read on every wake-up, so a delay change made while waiting
    /// applies to this request too.
    pub async fn claim(self) {
        loop {
            let claimed = lock(&self.spacing).try_claim();
            let wait = match claimed {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tokio::time::sleep(wait.max(MIN_RECHECK)).await;
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let mut spacing = lock(&self.spacing);
        spacing.queued = spacing.queued.saturating_sub(1);
    }
}

fn build(delay: Duration) -> Limiter {
    // Only a zero period has no quota, and delays are clamped above zero.
    let quota = Quota::with_period(delay).unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN));
    RateLimiter::direct(quota)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn first_claim_is_free_second_must_wait() {
        let spacing = Spacing::new(Duration::from_secs(1));
        assert!(spacing.try_claim().is_ok());
        let wait = spacing.try_claim().unwrap_err();
        assert!(wait > Duration::from_millis(900));
        assert!(wait <= Duration::from_secs(1));
    }

    #[test]
    fn slot_frees_after_delay() {
        let spacing = Spacing::new(Duration::from_millis(20));
        assert!(spacing.try_claim().is_ok());
        std::thread::sleep(Duration::from_millis(30));
        assert!(spacing.try_claim().is_ok());
    }

    #[test]
    fn changing_delay_keeps_slot_taken() {
        let mut spacing = Spacing::new(Duration::from_millis(200));
        spacing.set_delay(Duration::from_secs(2));
        assert_eq!(spacing.delay(), Duration::from_secs(2));
        assert!(spacing.try_claim().is_err());
    }

    #[test]
    fn waiters_count_towards_backlog_until_dropped() {
        let shared = Spacing::shared(Duration::from_millis(100));
        let first = Waiter::enqueue(&shared);
        let second = Waiter::enqueue(&shared);
        assert_eq!(lock(&shared).queued(), 2);
        assert_eq!(
            lock(&shared).backlog(Duration::from_millis(50)),
            Duration::from_millis(250)
        );

        drop(first);
        drop(second);
        assert_eq!(lock(&shared).queued(), 0);
    }

    #[tokio::test]
    async fn claiming_takes_the_slot() {
        let shared = Spacing::shared(Duration::from_millis(30));
        assert!(lock(&shared).try_claim().is_ok());
        Waiter::enqueue(&shared).claim().await;
        assert!(lock(&shared).try_claim().is_err());
        assert_eq!(lock(&shared).queued(), 0);
    }

    #[tokio::test]
    async fn waiter_follows_a_delay_raised_while_it_sleeps() {
        let shared = Spacing::shared(Duration::from_millis(20));
        assert!(lock(&shared).try_claim().is_ok());
        let waiter = Waiter::enqueue(&shared);
        let claimed = tokio::spawn(async move {
            waiter.claim().await;
            Instant::now()
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        let raised_at = Instant::now();
        lock(&shared).set_delay(Duration::from_millis(150));
        let claimed_at = claimed.await.unwrap();
        assert!(claimed_at.duration_since(raised_at) >= Duration::from_millis(140));
    }
}
