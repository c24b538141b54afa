// Copyright 2024 The Swap Nursery Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The shared registry of per-swap cancellation signals (§5). Each running
//! swap task registers a one-shot sender keyed by its id; the watcher or a
//! terminal status uses it to stop the task's event loop.

use crate::SwapId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};

/// A `oneshot::Sender<()>` fires at most once, matching the Go original's
/// single-close-channel `stopListening`/`stopHandler` pattern more directly
/// than a multi-shot channel would.
pub type CancelSender = oneshot::Sender<()>;
pub type CancelReceiver = oneshot::Receiver<()>;

/// Cloneable handle to the shared map. Readers (status lookups) take the
/// read lock; registration and cancellation take the write lock.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
	inner: Arc<RwLock<HashMap<SwapId, CancelSender>>>,
}

impl CancellationRegistry {
	pub fn new() -> Self {
		CancellationRegistry::default()
	}

	/// Registers `id`'s cancellation sender, returning the receiver the
	/// swap task should select on. Replaces and drops any prior sender for
	/// the same id without firing it, mirroring a task that re-registers
	/// itself after recovery.
	pub async fn register(&self, id: SwapId) -> CancelReceiver {
		let (tx, rx) = oneshot::channel();
		self.inner.write().await.insert(id, tx);
		rx
	}

	/// Fires `id`'s cancellation signal, if still registered. A second call
	/// for the same id, or a call for an id that already completed, is a
	/// no-op - cancellation is idempotent.
	pub async fn cancel(&self, id: &SwapId) {
		if let Some(sender) = self.inner.write().await.remove(id) {
			let _ = sender.send(());
		}
	}

	/// Drops `id`'s registration without firing it, used once a swap task
	/// exits on its own (terminal status) so a stale entry is not left
	/// behind for a future `cancel` to find.
	pub async fn deregister(&self, id: &SwapId) {
		self.inner.write().await.remove(id);
	}

	pub async fn is_registered(&self, id: &SwapId) -> bool {
		self.inner.read().await.contains_key(id)
	}

	pub async fn len(&self) -> usize {
		self.inner.read().await.len()
	}
}
