// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Typed event channels.
//!
//! Subscribers get their own receiver; publishing clones the small event
//! struct into every live channel and silently drops the ones whose
//! receiver went away.

use crate::primitives::{Hash256, OutPoint};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TipChanged {
    pub hash: Hash256,
    pub height: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxAcceptedEvent {
    pub txid: Hash256,
}

/// Evidence of a respend attempt against a pool entry; forwarded to the
/// relay layer which broadcasts the double-spend proof.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DoubleSpendSeen {
    pub outpoint: OutPoint,
    pub existing: Hash256,
    pub rejected: Hash256,
}

#[derive(Default)]
pub struct EventBus {
    tip_subs: Mutex<Vec<Sender<TipChanged>>>,
    accepted_subs: Mutex<Vec<Sender<TxAcceptedEvent>>>,
    double_spend_subs: Mutex<Vec<Sender<DoubleSpendSeen>>>,
}

fn publish<T: Clone>(subs: &Mutex<Vec<Sender<T>>>, event: &T) {
    subs.lock().retain(|sub| sub.send(event.clone()).is_ok());
}

fn subscribe<T>(subs: &Mutex<Vec<Sender<T>>>) -> Receiver<T> {
    let (sender, receiver) = unbounded();
    subs.lock().push(sender);
    receiver
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn subscribe_tip_change(&self) -> Receiver<TipChanged> {
        subscribe(&self.tip_subs)
    }

    #[must_use]
    pub fn subscribe_tx_accepted(&self) -> Receiver<TxAcceptedEvent> {
        subscribe(&self.accepted_subs)
    }

    #[must_use]
    pub fn subscribe_double_spend(&self) -> Receiver<DoubleSpendSeen> {
        subscribe(&self.double_spend_subs)
    }

    pub fn publish_tip_change(&self, event: TipChanged) {
        publish(&self.tip_subs, &event);
    }

    pub fn publish_tx_accepted(&self, event: TxAcceptedEvent) {
        publish(&self.accepted_subs, &event);
    }

    pub fn publish_double_spend(&self, event: DoubleSpendSeen) {
        publish(&self.double_spend_subs, &event);
    }
}
