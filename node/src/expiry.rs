// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use custody_node_storage::KvBackend;

use crate::node::Node;

/// Background task that reclaims batches past their custody window.
pub struct ExpiryService {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ExpiryService {
    /// Starts a pass every `interval`, the first one immediately.
    pub fn spawn<B: KvBackend>(node: Node<B>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = node.expire_once().await {
                            log::error!("expiry pass failed: {}", e);
                        }
                    }
                }
            }
            log::info!("expiry service stopped");
        });
        Self { cancel, handle }
    }

    /// Token that stops the service when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the service and waits for an in-flight pass to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            log::error!("expiry task failed: {}", e);
        }
    }
}
