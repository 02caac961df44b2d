// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deadline-based leak suspicion for registered objects.
//!
//! The detector only ever holds [`Weak`] handles, so registering an object
//! never keeps it alive. An object is suspected once it is still reachable
//! after its deadline: either the one supplied at registration or
//! `registered_at + leak_timeout`.
//!
//! Objects are keyed by allocation address. An address can be reused once
//! the original allocation is freed; re-registering simply replaces the
//! stale entry.

use crate::error::DiagnosticsError;
use crate::service::{request, respond, send};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

const SERVICE_NAME: &str = "memory leak detector";

type TrackedRef = Weak<dyn Any + Send + Sync>;

/// Identity of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl ObjectId {
    #[must_use]
    pub fn of<T: ?Sized>(object: &Arc<T>) -> Self {
        Self(Arc::as_ptr(object).cast::<()>() as usize)
    }

    #[must_use]
    pub fn of_weak<T: ?Sized>(object: &Weak<T>) -> Self {
        Self(Weak::as_ptr(object).cast::<()>() as usize)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuspectedLeak {
    pub object_id: ObjectId,
    pub registered_at: Instant,
    pub message: String,
}

struct LeakRegistration {
    registered_at: Instant,
    expected_deadline: Option<Instant>,
    handle: TrackedRef,
}

impl LeakRegistration {
    fn is_alive(&self) -> bool {
        self.handle.strong_count() > 0
    }
}

#[derive(Default)]
pub struct MemoryLeakDetector {
    registrations: HashMap<ObjectId, LeakRegistration>,
}

impl MemoryLeakDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `handle` under `object_id`. A handle whose object is already
    /// gone is still recorded; the next sweep purges it.
    pub fn register(
        &mut self,
        object_id: ObjectId,
        handle: TrackedRef,
        expected_deadline: Option<Instant>,
    ) {
        self.register_at(object_id, handle, expected_deadline, Instant::now());
    }

    fn register_at(
        &mut self,
        object_id: ObjectId,
        handle: TrackedRef,
        expected_deadline: Option<Instant>,
        now: Instant,
    ) {
        self.registrations.insert(
            object_id,
            LeakRegistration {
                registered_at: now,
                expected_deadline,
                handle,
            },
        );
    }

    pub fn unregister(&mut self, object_id: ObjectId) {
        self.registrations.remove(&object_id);
    }

    #[must_use]
    pub fn suspected_leaks(&mut self, leak_timeout: Duration) -> Vec<SuspectedLeak> {
        self.suspected_leaks_at(leak_timeout, Instant::now())
    }

    /// Purge registrations whose object is gone, then report every live one
    /// past its deadline, ordered by registration time.
    fn suspected_leaks_at(&mut self, leak_timeout: Duration, now: Instant) -> Vec<SuspectedLeak> {
        let before = self.registrations.len();
        self.registrations.retain(|_, registration| registration.is_alive());
        let purged = before - self.registrations.len();
        if purged > 0 {
            trace!("Purged {purged} released objects from leak tracking");
        }

        let mut leaks: Vec<SuspectedLeak> = self
            .registrations
            .iter()
            .filter(|(_, registration)| {
                let deadline = registration
                    .expected_deadline
                    .unwrap_or(registration.registered_at + leak_timeout);
                now > deadline
            })
            .map(|(object_id, registration)| SuspectedLeak {
                object_id: *object_id,
                registered_at: registration.registered_at,
                message: "Object still alive after timeout".to_string(),
            })
            .collect();
        leaks.sort_by_key(|leak| (leak.registered_at, leak.object_id));
        leaks
    }

    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.registrations.len()
    }

    pub fn reset(&mut self) {
        self.registrations.clear();
    }
}

impl fmt::Debug for MemoryLeakDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLeakDetector")
            .field("registrations", &self.registrations.len())
            .finish()
    }
}

pub enum LeakCommand {
    Register {
        object_id: ObjectId,
        handle: TrackedRef,
        expected_deadline: Option<Instant>,
    },
    Unregister(ObjectId),
    SuspectedLeaks {
        leak_timeout: Duration,
        response_tx: oneshot::Sender<Vec<SuspectedLeak>>,
    },
    RegisteredCount(oneshot::Sender<usize>),
    Reset,
    Shutdown,
}

impl fmt::Debug for LeakCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeakCommand::Register { object_id, .. } => write!(f, "Register({object_id})"),
            LeakCommand::Unregister(object_id) => write!(f, "Unregister({object_id})"),
            LeakCommand::SuspectedLeaks { leak_timeout, .. } => {
                write!(f, "SuspectedLeaks({leak_timeout:?})")
            }
            LeakCommand::RegisteredCount(_) => f.write_str("RegisteredCount"),
            LeakCommand::Reset => f.write_str("Reset"),
            LeakCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LeakHandle {
    tx: mpsc::UnboundedSender<LeakCommand>,
}

impl LeakHandle {
    /// Track `object` without extending its lifetime.
    pub fn register<T: Any + Send + Sync>(
        &self,
        object: &Arc<T>,
        expected_deadline: Option<Instant>,
    ) -> ObjectId {
        let weak = Arc::downgrade(object);
        let handle: TrackedRef = weak;
        self.register_weak(handle, expected_deadline)
    }

    /// Track an object the caller only holds weakly. Works for handles whose
    /// object is already gone.
    pub fn register_weak(&self, handle: TrackedRef, expected_deadline: Option<Instant>) -> ObjectId {
        let object_id = ObjectId::of_weak(&handle);
        send(
            &self.tx,
            SERVICE_NAME,
            LeakCommand::Register {
                object_id,
                handle,
                expected_deadline,
            },
        );
        object_id
    }

    pub fn unregister<T: ?Sized>(&self, object: &Arc<T>) {
        self.record_drop(ObjectId::of(object));
    }

    /// Cooperative notification that the object with `object_id` was destroyed.
    pub fn record_drop(&self, object_id: ObjectId) {
        send(&self.tx, SERVICE_NAME, LeakCommand::Unregister(object_id));
    }

    pub async fn suspected_leaks(
        &self,
        leak_timeout: Duration,
    ) -> Result<Vec<SuspectedLeak>, DiagnosticsError> {
        request(&self.tx, SERVICE_NAME, |response_tx| {
            LeakCommand::SuspectedLeaks {
                leak_timeout,
                response_tx,
            }
        })
        .await
    }

    pub async fn registered_count(&self) -> Result<usize, DiagnosticsError> {
        request(&self.tx, SERVICE_NAME, LeakCommand::RegisteredCount).await
    }

    pub fn reset(&self) {
        send(&self.tx, SERVICE_NAME, LeakCommand::Reset);
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<LeakCommand>> {
        self.tx.send(LeakCommand::Shutdown)
    }
}

pub struct LeakService {
    detector: MemoryLeakDetector,
    rx: mpsc::UnboundedReceiver<LeakCommand>,
}

impl LeakService {
    #[must_use]
    pub fn new() -> (Self, LeakHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            detector: MemoryLeakDetector::new(),
            rx,
        };
        (service, LeakHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Memory leak detector service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                LeakCommand::Register {
                    object_id,
                    handle,
                    expected_deadline,
                } => self.detector.register(object_id, handle, expected_deadline),
                LeakCommand::Unregister(object_id) => self.detector.unregister(object_id),
                LeakCommand::SuspectedLeaks {
                    leak_timeout,
                    response_tx,
                } => respond(
                    response_tx,
                    SERVICE_NAME,
                    self.detector.suspected_leaks(leak_timeout),
                ),
                LeakCommand::RegisteredCount(response_tx) => {
                    respond(response_tx, SERVICE_NAME, self.detector.registered_count());
                }
                LeakCommand::Reset => self.detector.reset(),
                LeakCommand::Shutdown => {
                    debug!("Memory leak detector service shutting down");
                    break;
                }
            }
        }

        debug!("Memory leak detector service stopped");
    }
}
