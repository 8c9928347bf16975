//! Two-level concurrency budget and request cancellation.
//!
//! Targets are grouped by subscription. At most `subscriptions` groups run
//! at once, and within a group at most `resources_per_subscription` targets
//! run at once. Results land in a slot addressed by target index, so the
//! output order never depends on completion order.
//!
//! ```text
//! run(targets)
//!   ├── subscription A  ← outer permit
//!   │     ├── target 0  ← inner permit (A)
//!   │     └── target 2  ← inner permit (A)
//!   └── subscription B  ← outer permit
//!         └── target 1  ← inner permit (B)
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use azmon_core::{ConcurrencyConfig, ResolvedTarget};
use futures::future::join_all;
use tokio::sync::{Semaphore, watch};
use tokio::time::Instant;
use tracing::debug;

/// Cooperative cancellation for one probe request.
///
/// Fires when the paired [`CancelHandle`] is triggered or the deadline
/// passes, whichever comes first.
#[derive(Clone)]
pub struct Cancellation {
    signal: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

/// Trigger side of a [`Cancellation`].
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

impl Cancellation {
    /// A cancellation bound to an optional deadline, plus its trigger.
    pub fn new(deadline: Option<Instant>) -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle(tx),
            Self {
                signal: rx,
                deadline,
            },
        )
    }

    /// A cancellation that only fires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::new(Some(deadline)).1
    }

    /// A cancellation that never fires.
    pub fn never() -> Self {
        Self::new(None).1
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the request is cancelled.
    pub async fn cancelled(&self) {
        let mut signal = self.signal.clone();
        let triggered = async move {
            // A dropped handle can no longer cancel.
            if signal.wait_for(|c| *c).await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = triggered => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => triggered.await,
        }
    }
}

/// Subscription-level × resource-level fan-out limits.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyBudget {
    subscriptions: usize,
    resources_per_subscription: usize,
}

impl ConcurrencyBudget {
    pub fn new(subscriptions: usize, resources_per_subscription: usize) -> Self {
        Self {
            subscriptions: subscriptions.max(1),
            resources_per_subscription: resources_per_subscription.max(1),
        }
    }

    pub fn from_config(config: &ConcurrencyConfig) -> Self {
        Self::new(config.subscriptions, config.resources_per_subscription)
    }

    /// Run `task` once per target under the budget.
    ///
    /// Returns one value per target, in target order. If `cancel` fires
    /// first, in-flight tasks are dropped and their slots are filled with
    /// `on_cancel()`; already finished results are kept.
    pub async fn run<'a, T, F, Fut, C>(
        &self,
        targets: &'a [ResolvedTarget],
        cancel: &Cancellation,
        task: F,
        on_cancel: C,
    ) -> Vec<T>
    where
        F: Fn(usize, &'a ResolvedTarget) -> Fut,
        Fut: Future<Output = T>,
        C: Fn() -> T,
    {
        let slots: Mutex<Vec<Option<T>>> = Mutex::new((0..targets.len()).map(|_| None).collect());
        let groups = group_by_subscription(targets);
        let outer = Semaphore::new(self.subscriptions);

        let work = join_all(groups.iter().map(|(subscription, indices)| {
            let outer = &outer;
            let slots = &slots;
            let task = &task;
            async move {
                let Ok(_permit) = outer.acquire().await else {
                    return;
                };
                debug!(%subscription, targets = indices.len(), "processing subscription");
                let inner = Semaphore::new(self.resources_per_subscription);
                join_all(indices.iter().map(|&idx| {
                    let inner = &inner;
                    async move {
                        let Ok(_permit) = inner.acquire().await else {
                            return;
                        };
                        let value = task(idx, &targets[idx]).await;
                        slots.lock().unwrap_or_else(PoisonError::into_inner)[idx] = Some(value);
                    }
                }))
                .await;
            }
        }));

        tokio::select! {
            _ = work => {}
            _ = cancel.cancelled() => {
                debug!(targets = targets.len(), "fan-out cancelled");
            }
        }

        slots
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .map(|slot| slot.unwrap_or_else(&on_cancel))
            .collect()
    }
}

/// Group target indices by subscription, in first-seen order.
fn group_by_subscription(targets: &[ResolvedTarget]) -> Vec<(&str, Vec<usize>)> {
    let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (i, target) in targets.iter().enumerate() {
        let key = target.subscription_id.to_ascii_lowercase();
        match index.get(&key) {
            Some(&g) => groups[g].1.push(i),
            None => {
                index.insert(key, groups.len());
                groups.push((target.subscription_id.as_str(), vec![i]));
            }
        }
    }
    groups
}
