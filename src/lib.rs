// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! A concurrency- and lifecycle-managed central-role runtime for Bluetooth
//! Low Energy: a declarative, observable model of nearby and connected
//! peripherals, their services and their characteristics, layered over a
//! pluggable [`backend::GattBackend`].
//!
//! The [`Central`] coordinator owns the backend handle and the
//! [`discovery`] session; [`peripheral::Peripheral`] owns per-device
//! connection lifecycle, GATT discovery and per-characteristic request
//! serialization; [`codec`] is the byte-level wire format for characteristic
//! values; [`observation`] is the `onChange`/async-stream plumbing shared by
//! every observable property in the crate.

pub mod backend;
pub mod bleuuid;
pub mod central;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod model;
pub mod observation;
pub mod peripheral;

pub use bleuuid::BTUuid;
pub use central::Central;
pub use error::{Error, Result};
pub use peripheral::{Characteristic, CharacteristicLifecycleEvent, Peripheral, Service};

use static_assertions::assert_impl_all;

// Ensure the two cheap-to-clone, thread-shared handles stay that way.
assert_impl_all!(Central: Clone, Send, Sized, Sync);
assert_impl_all!(Peripheral: Clone, Send, Sized, Sync);
