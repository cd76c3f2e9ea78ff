//! Adapter from address-set pushes to a tonic balance channel

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tonic::transport::channel::Change;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use super::AddressListener;
use crate::model::{Address, AddressSet};

/// Feeds resolver pushes into a round-robin balanced [`Channel`]
///
/// Each push is diffed against the current endpoint set and translated into
/// `Change::Insert` / `Change::Remove` messages.
pub struct BalancedChannelListener {
    tx: mpsc::UnboundedSender<AddressSet>,
}

impl BalancedChannelListener {
    /// Create a balanced channel and the listener that drives it
    ///
    /// Must be called from within a Tokio runtime.
    pub fn channel(capacity: usize, connect_timeout: Duration) -> (Channel, Self) {
        let (channel, changes) = Channel::balance_channel::<Address>(capacity);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(apply_changes(rx, changes, connect_timeout));
        (channel, Self { tx })
    }
}

impl AddressListener for BalancedChannelListener {
    fn update_state(&self, addresses: AddressSet) {
        if self.tx.send(addresses).is_err() {
            debug!("Balanced channel dropped, ignoring address update");
        }
    }
}

async fn apply_changes(
    mut rx: mpsc::UnboundedReceiver<AddressSet>,
    changes: mpsc::Sender<Change<Address, Endpoint>>,
    connect_timeout: Duration,
) {
    let mut current: HashSet<Address> = HashSet::new();

    while let Some(set) = rx.recv().await {
        let next: HashSet<Address> = set.into_inner().into_iter().collect();

        for removed in current.difference(&next) {
            if changes.send(Change::Remove(removed.clone())).await.is_err() {
                return;
            }
        }

        for added in next.difference(&current) {
            let endpoint = match Endpoint::from_shared(format!("http://{}", added)) {
                Ok(endpoint) => endpoint.connect_timeout(connect_timeout),
                Err(err) => {
                    warn!(address = %added, error = %err, "Skipping unusable endpoint");
                    continue;
                }
            };
            if changes
                .send(Change::Insert(added.clone(), endpoint))
                .await
                .is_err()
            {
                return;
            }
        }

        current = next;
    }
}
