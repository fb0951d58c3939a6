// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Observable properties: a relaxed atomic snapshot readable from any
//! thread, a registrar of `onChange` closures invoked in registration
//! order, and an async-stream subscription, side by side.
//!
//! [`OnChangeRegistration`] owns only a weak back-reference to the
//! property it was registered on, so dropping it - from any thread - never
//! keeps the owner alive and always frees the registrar slot.

use futures::stream::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// A scoped handle returned by [`Observable::on_change`]. Dropping it (or
/// calling [`OnChangeRegistration::cancel`] explicitly) deregisters the
/// handler.
pub struct OnChangeRegistration {
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl OnChangeRegistration {
    pub fn cancel(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }

    /// Build a registration from a bare cleanup closure. Used by callers
    /// (e.g. characteristic lifecycle handlers) that need the same
    /// drop-deregisters shape as [`Observable::on_change`] without going
    /// through an `Observable` themselves.
    pub(crate) fn new(cleanup: impl FnOnce() + Send + 'static) -> Self {
        OnChangeRegistration {
            cleanup: Some(Box::new(cleanup)),
        }
    }
}

impl Drop for OnChangeRegistration {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

struct Inner<T> {
    value: RwLock<T>,
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<u64, Box<dyn Fn(&T) + Send + Sync>>>,
    tx: broadcast::Sender<T>,
}

/// A single observable property. Cheap to clone; clones share the same
/// underlying value, registrar and broadcast channel.
pub struct Observable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Observable {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = broadcast::channel(32);
        Observable {
            inner: Arc::new(Inner {
                value: RwLock::new(initial),
                next_id: AtomicU64::new(0),
                handlers: Mutex::new(BTreeMap::new()),
                tx,
            }),
        }
    }

    /// A relaxed snapshot of the current value. Callable from any thread;
    /// consecutive reads of two different `Observable`s may reflect
    /// different points in time by design.
    pub fn get(&self) -> T {
        self.inner.value.read().unwrap().clone()
    }

    /// Write a new value and fire every registered handler, in
    /// registration order, followed by the broadcast to stream
    /// subscribers. Must only be called from the serial execution
    /// context that owns this property.
    pub(crate) fn set(&self, new_value: T) {
        *self.inner.value.write().unwrap() = new_value.clone();
        let handlers = self.inner.handlers.lock().unwrap();
        for handler in handlers.values() {
            handler(&new_value);
        }
        drop(handlers);
        let _ = self.inner.tx.send(new_value);
    }

    /// Register a closure invoked on every future transition. If `initial`
    /// is set, it also fires once immediately with the current value.
    pub fn on_change<F>(&self, initial: bool, handler: F) -> OnChangeRegistration
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        if initial {
            handler(&self.get());
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().unwrap().insert(id, Box::new(handler));

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        OnChangeRegistration {
            cleanup: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handlers.lock().unwrap().remove(&id);
                }
            })),
        }
    }

    /// A stream that yields every future value until dropped, at which
    /// point the internal subscription is removed.
    pub fn subscribe(&self) -> Pin<Box<dyn Stream<Item = T> + Send>>
    where
        T: Send,
    {
        let receiver = self.inner.tx.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|item| item.ok()))
    }
}
