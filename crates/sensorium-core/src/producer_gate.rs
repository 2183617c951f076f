// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-producer function gate
//!
//! Calls into one producer fall into three categories. Each call takes a
//! ticket from a sequence counter and is admitted when:
//! - `State`: its ticket is the earliest outstanding ticket of any category
//! - `ReleaseFrame`: no earlier `State` or `ReleaseFrame` ticket is outstanding
//! - `Property`: no earlier `State` or `Property` ticket is outstanding
//!
//! A `State` call therefore waits only for work queued before it, and no
//! later arrival can overtake it. While a `State` call is admitted the
//! state-changing flag is raised so the production loop can leave at its
//! next check.

use crate::error::CoreResult;
use crate::sync::{lock, lock_recover, wait, wait_failed};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use tracing::trace;

/// Category of a producer call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCategory {
    /// open, close, start, stop
    State,
    ReleaseFrame,
    /// get, set
    Property,
}

#[derive(Debug, Default)]
struct TicketQueue {
    next_ticket: u64,
    state: BTreeSet<u64>,
    release_frame: BTreeSet<u64>,
    property: BTreeSet<u64>,
}

impl TicketQueue {
    fn tickets(&mut self, category: FunctionCategory) -> &mut BTreeSet<u64> {
        match category {
            FunctionCategory::State => &mut self.state,
            FunctionCategory::ReleaseFrame => &mut self.release_frame,
            FunctionCategory::Property => &mut self.property,
        }
    }

    fn enqueue(&mut self, category: FunctionCategory) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.tickets(category).insert(ticket);
        ticket
    }

    fn withdraw(&mut self, category: FunctionCategory, ticket: u64) {
        self.tickets(category).remove(&ticket);
    }

    fn earliest(set: &BTreeSet<u64>) -> u64 {
        set.first().copied().unwrap_or(u64::MAX)
    }

    fn is_admitted(&self, category: FunctionCategory, ticket: u64) -> bool {
        let first_state = Self::earliest(&self.state);
        match category {
            FunctionCategory::State => {
                first_state == ticket
                    && Self::earliest(&self.release_frame) > ticket
                    && Self::earliest(&self.property) > ticket
            }
            FunctionCategory::ReleaseFrame => {
                first_state > ticket && Self::earliest(&self.release_frame) == ticket
            }
            FunctionCategory::Property => {
                first_state > ticket && Self::earliest(&self.property) == ticket
            }
        }
    }

    fn len(&self) -> usize {
        self.state.len() + self.release_frame.len() + self.property.len()
    }
}

/// Serializes State / ReleaseFrame / Property calls into one producer
#[derive(Debug)]
pub struct ProducerFunctionGate {
    label: String,
    queue: Mutex<TicketQueue>,
    wake: Condvar,
    state_changing: AtomicBool,
}

impl ProducerFunctionGate {
    /// `label` names the producer in logs and errors
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            queue: Mutex::new(TicketQueue::default()),
            wake: Condvar::new(),
            state_changing: AtomicBool::new(false),
        }
    }

    pub fn lock_for_state(&self) -> CoreResult<ProducerGuard<'_>> {
        self.acquire(FunctionCategory::State)
    }

    pub fn lock_for_release_frame(&self) -> CoreResult<ProducerGuard<'_>> {
        self.acquire(FunctionCategory::ReleaseFrame)
    }

    pub fn lock_for_property(&self) -> CoreResult<ProducerGuard<'_>> {
        self.acquire(FunctionCategory::Property)
    }

    /// True while a `State` call is admitted; read without locking
    pub fn is_state_changing(&self) -> bool {
        self.state_changing.load(Ordering::Acquire)
    }

    /// Tickets queued or admitted
    pub fn outstanding(&self) -> usize {
        lock_recover(&self.queue).len()
    }

    fn acquire(&self, category: FunctionCategory) -> CoreResult<ProducerGuard<'_>> {
        let mut queue = lock(&self.queue, &self.label)?;
        let ticket = queue.enqueue(category);
        trace!("[PRODUCER-GATE] {} {:?} ticket #{}", self.label, category, ticket);

        while !queue.is_admitted(category, ticket) {
            queue = match wait(&self.wake, queue) {
                Ok(queue) => queue,
                Err(mut recovered) => {
                    recovered.withdraw(category, ticket);
                    drop(recovered);
                    self.wake.notify_all();
                    return Err(wait_failed(&self.label));
                }
            };
        }

        if category == FunctionCategory::State {
            self.state_changing.store(true, Ordering::Release);
        }
        Ok(ProducerGuard {
            gate: self,
            category,
            ticket,
        })
    }
}

/// Admitted producer call; released on drop
#[derive(Debug)]
pub struct ProducerGuard<'a> {
    gate: &'a ProducerFunctionGate,
    category: FunctionCategory,
    ticket: u64,
}

impl ProducerGuard<'_> {
    pub fn category(&self) -> FunctionCategory {
        self.category
    }
}

impl Drop for ProducerGuard<'_> {
    fn drop(&mut self) {
        let mut queue = lock_recover(&self.gate.queue);
        queue.withdraw(self.category, self.ticket);
        if self.category == FunctionCategory::State {
            self.gate.state_changing.store(false, Ordering::Release);
        }
        drop(queue);
        self.gate.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCause;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn gate() -> Arc<ProducerFunctionGate> {
        Arc::new(ProducerFunctionGate::new("test-producer"))
    }

    fn wait_for_outstanding(gate: &ProducerFunctionGate, count: usize) {
        while gate.outstanding() < count {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_release_frame_and_property_run_together() {
        let gate = gate();
        let release = gate.lock_for_release_frame().unwrap();
        let property = gate.lock_for_property().unwrap();
        assert_eq!(release.category(), FunctionCategory::ReleaseFrame);
        assert_eq!(property.category(), FunctionCategory::Property);
        assert!(!gate.is_state_changing());
    }

    #[test]
    fn test_same_category_serializes() {
        let gate = gate();
        let first = gate.lock_for_property().unwrap();

        let (tx, rx) = mpsc::channel();
        let second = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _guard = gate.lock_for_property().unwrap();
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(first);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        second.join().unwrap();
    }

    #[test]
    fn test_state_is_exclusive_and_raises_flag() {
        let gate = gate();
        let release = gate.lock_for_release_frame().unwrap();

        let (tx, rx) = mpsc::channel();
        let state = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let guard = gate.lock_for_state().unwrap();
                tx.send(gate.is_state_changing()).unwrap();
                drop(guard);
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(release);
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        state.join().unwrap();
        assert!(!gate.is_state_changing());
    }

    #[test]
    fn test_later_calls_queue_behind_pending_state() {
        let gate = gate();
        let order = Arc::new(Mutex::new(Vec::new()));
        let property = gate.lock_for_property().unwrap();

        let state = {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let _guard = gate.lock_for_state().unwrap();
                order.lock().unwrap().push("state");
            })
        };
        wait_for_outstanding(&gate, 2);

        // Arrives after the State request: must not overtake it
        let late = {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let _guard = gate.lock_for_release_frame().unwrap();
                order.lock().unwrap().push("release");
            })
        };
        wait_for_outstanding(&gate, 3);
        thread::sleep(Duration::from_millis(20));
        assert!(order.lock().unwrap().is_empty());

        drop(property);
        state.join().unwrap();
        late.join().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["state", "release"]);
    }

    #[test]
    fn test_state_not_starved_by_continuous_traffic() {
        let gate = gate();
        let stop = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(5));

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let gate = Arc::clone(&gate);
                let stop = Arc::clone(&stop);
                let completed = Arc::clone(&completed);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    while !stop.load(Ordering::Acquire) {
                        let _guard = if i % 2 == 0 {
                            gate.lock_for_property().unwrap()
                        } else {
                            gate.lock_for_release_frame().unwrap()
                        };
                        completed.fetch_add(1, Ordering::Relaxed);
                        thread::sleep(Duration::from_micros(200));
                    }
                })
            })
            .collect();

        barrier.wait();
        thread::sleep(Duration::from_millis(20));

        let (tx, rx) = mpsc::channel();
        let state = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _guard = gate.lock_for_state().unwrap();
                tx.send(()).unwrap();
            })
        };

        let admitted = rx.recv_timeout(Duration::from_secs(5));
        stop.store(true, Ordering::Release);
        state.join().unwrap();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(admitted.is_ok(), "State request starved");
        assert!(completed.load(Ordering::Relaxed) > 0);
        assert_eq!(gate.outstanding(), 0);
    }

    fn poison(gate: &ProducerFunctionGate) {
        thread::scope(|s| {
            let _ = s
                .spawn(|| {
                    let _queue = gate.queue.lock().unwrap();
                    panic!("ticket queue poisoned");
                })
                .join();
        });
    }

    #[test]
    fn test_poisoned_queue_aborts_every_category() {
        let gate = gate();
        poison(&gate);
        assert_eq!(gate.lock_for_state().unwrap_err().cause(), ErrorCause::Aborted);
        assert_eq!(gate.lock_for_release_frame().unwrap_err().cause(), ErrorCause::Aborted);
        assert_eq!(gate.lock_for_property().unwrap_err().cause(), ErrorCause::Aborted);
        assert_eq!(gate.outstanding(), 0);
        assert!(!gate.is_state_changing());
    }

    #[test]
    fn test_queued_ticket_withdrawn_when_wait_fails() {
        let gate = gate();
        let holder = gate.lock_for_state().unwrap();
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.lock_for_property().map(|_| ()).map_err(|e| e.cause()))
        };
        wait_for_outstanding(&gate, 2);

        poison(&gate);
        drop(holder);
        assert_eq!(waiter.join().unwrap(), Err(ErrorCause::Aborted));
        assert_eq!(gate.outstanding(), 0);
        assert!(!gate.is_state_changing());
    }
}
