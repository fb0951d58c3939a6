// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The per-characteristic operation slot: the non-trivial part of the
//! peripheral model (spec §4.3). At most one GATT request is outstanding
//! per slot; acquisition is fair and cancellation-safe because it rides on
//! `tokio::sync::Mutex`, and the slot itself is where the backend event
//! dispatcher resolves the matching reply.

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::Mutex as StdMutex;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

pub(crate) struct OperationSlot<T> {
    fairness: AsyncMutex<()>,
    pending: StdMutex<Option<oneshot::Sender<Result<T>>>>,
}

/// Clears a stale pending continuation when the acquiring future is
/// dropped before a reply arrives, so a late backend event can't be
/// mistaken for the next operation's reply.
struct ClearOnDrop<'a, T> {
    pending: &'a StdMutex<Option<oneshot::Sender<Result<T>>>>,
}

impl<T> Drop for ClearOnDrop<'_, T> {
    fn drop(&mut self) {
        self.pending.lock().unwrap().take();
    }
}

impl<T> OperationSlot<T> {
    pub fn new() -> Self {
        OperationSlot {
            fairness: AsyncMutex::new(()),
            pending: StdMutex::new(None),
        }
    }

    /// Acquire the slot, perform `submit` (the non-blocking backend
    /// submission), then wait for [`OperationSlot::resolve`] to be called
    /// by the event dispatcher. Dropping the returned future early
    /// releases the slot immediately; any backend reply that arrives
    /// afterwards finds no pending continuation and is discarded (treated
    /// as an unsolicited update by the caller).
    pub async fn run<Fut>(&self, submit: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<()>>,
    {
        let _permit = self.fairness.lock().await;
        let (tx, rx) = oneshot::channel();
        *self.pending.lock().unwrap() = Some(tx);
        let _guard = ClearOnDrop {
            pending: &self.pending,
        };
        submit.await?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Like [`OperationSlot::run`], but never queues: if the fairness
    /// mutex is already held (an operation is in flight), returns `None`
    /// immediately without submitting anything, instead of waiting in
    /// line for it. Used by callers that must fail fast rather than
    /// serialize behind an in-progress operation (e.g. a control point's
    /// `ControlPointInProgress` rejection), where a separate `is_busy()`
    /// check followed by `run()` would leave a TOCTOU window in which two
    /// concurrent callers both observe "idle" before either has claimed
    /// the slot.
    pub async fn try_run<Fut>(&self, submit: Fut) -> Option<Result<T>>
    where
        Fut: Future<Output = Result<()>>,
    {
        let _permit = self.fairness.try_lock().ok()?;
        let (tx, rx) = oneshot::channel();
        *self.pending.lock().unwrap() = Some(tx);
        let _guard = ClearOnDrop {
            pending: &self.pending,
        };
        if let Err(error) = submit.await {
            return Some(Err(error));
        }
        Some(match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        })
    }

    /// Resolve the outstanding operation, if there is one. Returns `false`
    /// if the slot was idle (no matching slot), meaning the caller should
    /// treat the value as an unsolicited notification instead.
    pub fn resolve(&self, result: Result<T>) -> bool {
        match self.pending.lock().unwrap().take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Force-resolve with `error`, used when the peripheral disconnects
    /// while an operation is outstanding.
    pub fn force_cancel(&self, error: Error) {
        self.resolve(Err(error));
    }

    pub fn is_busy(&self) -> bool {
        self.pending.lock().unwrap().is_some()
    }
}
