// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The error type returned by every fallible operation in this crate.

use crate::bleuuid::BTUuid;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Every kind of failure the core can report to a caller.
///
/// This is the single error type threaded through the whole crate; the
/// concrete platform backend's own errors are carried verbatim inside
/// [`Error::Backend`].
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The operation targeted a service or characteristic that has not
    /// (yet) been discovered, or the peripheral is not connected.
    #[error("not present: {0}")]
    NotPresent(NotPresent),

    /// A byte buffer could not be decoded into the requested type.
    #[error("value has no valid representation for the requested type")]
    IncompatibleDataFormat,

    /// A request was sent to a control-point characteristic while
    /// notifications were not enabled on it.
    #[error("control point {service}/{characteristic} requires notifications to be enabled before use")]
    ControlPointRequiresNotifying {
        service: BTUuid,
        characteristic: BTUuid,
    },

    /// A request was sent to a control-point characteristic while a prior
    /// request on the same control point is still awaiting its response.
    #[error("control point {service}/{characteristic} already has a request in progress")]
    ControlPointInProgress {
        service: BTUuid,
        characteristic: BTUuid,
    },

    /// Propagated verbatim from the platform GATT backend. The abstract
    /// backend interface carries its errors as strings (see
    /// `BackendEvent`'s `error` fields), so there is nothing more
    /// structured to preserve here.
    #[error("backend error: {0}")]
    Backend(String),

    /// The operation was cancelled, either by the caller or because the
    /// peripheral disconnected while the operation was outstanding.
    #[error("operation was cancelled")]
    Cancelled,

    /// The operation did not complete within its caller-supplied timeout.
    #[error("operation timed out")]
    Timeout,
}

/// Identifies what was missing for a [`Error::NotPresent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotPresent {
    pub service: Option<BTUuid>,
    pub characteristic: Option<BTUuid>,
}

impl Display for NotPresent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (&self.service, &self.characteristic) {
            (Some(s), Some(c)) => write!(f, "service {s} characteristic {c}"),
            (Some(s), None) => write!(f, "service {s}"),
            (None, Some(c)) => write!(f, "characteristic {c}"),
            (None, None) => write!(f, "peripheral not connected"),
        }
    }
}

impl Error {
    pub(crate) fn not_present_characteristic(service: BTUuid, characteristic: BTUuid) -> Self {
        Error::NotPresent(NotPresent {
            service: Some(service),
            characteristic: Some(characteristic),
        })
    }

    pub(crate) fn not_connected() -> Self {
        Error::NotPresent(NotPresent {
            service: None,
            characteristic: None,
        })
    }

    /// Build an `Error` from a `BackendEvent`'s optional error string,
    /// falling back to `fallback` when the backend reported success but the
    /// caller still needs an `Err` (e.g. a disconnect with no reason given).
    pub(crate) fn from_backend_option(error: Option<String>, fallback: Error) -> Self {
        match error {
            Some(message) => Error::Backend(message),
            None => fallback,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
