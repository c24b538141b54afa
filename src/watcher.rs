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

//! Component D: the block-height watcher. Subscribes to the local Lightning
//! node's own block notifications and refunds any forward swap whose
//! timeout has passed (§4.4, §6 `register_block_listener`), independent of
//! whatever the exchange's event stream reports - a swap the exchange has
//! gone silent on must still get its funds back.

use crate::clients::{ChainClient, LnClient, Store};
use crate::config::NurseryConfig;
use crate::error::Error;
use crate::nursery::Nursery;
use crate::scrooge::Scrooge;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

pub struct Watcher {
	chain: Arc<dyn ChainClient>,
	ln: Arc<dyn LnClient>,
	store: Arc<dyn Store>,
	scrooge: Arc<Scrooge>,
	nursery: Arc<Nursery>,
	config: NurseryConfig,
}

impl Watcher {
	pub fn new(
		chain: Arc<dyn ChainClient>,
		ln: Arc<dyn LnClient>,
		store: Arc<dyn Store>,
		scrooge: Arc<Scrooge>,
		nursery: Arc<Nursery>,
		config: NurseryConfig,
	) -> Arc<Self> {
		Arc::new(Watcher {
			chain,
			ln,
			store,
			scrooge,
			nursery,
			config,
		})
	}

	/// Spawns the block-driven refund sweep alongside a periodic backstop
	/// that retries building a batch out of whatever is still pending, in
	/// case a prior trigger's broadcast never made it out. Returns a handle
	/// whose drop (or explicit send) stops both.
	pub fn spawn(self: Arc<Self>) -> oneshot::Sender<()> {
		let (stop_tx, mut stop_rx) = oneshot::channel();
		let backstop_period = Duration::from_secs(self.config.batch_poll_interval_secs.max(1));

		tokio::spawn(async move {
			let mut heights = match self.ln.register_block_listener().await {
				Ok(rx) => rx,
				Err(e) => {
					warn!("block watcher could not subscribe to block notifications: {}", e);
					return;
				}
			};
			let mut backstop = tokio::time::interval(backstop_period);

			loop {
				tokio::select! {
					_ = &mut stop_rx => {
						info!("block watcher stopping");
						return;
					}
					event = heights.recv() => match event {
						Ok(height) => {
							if let Err(e) = self.sweep_refundable(height).await {
								warn!("block watcher sweep at height {} failed: {}", height, e);
							}
						}
						Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
							warn!("block watcher lagged {} notifications, continuing", skipped);
						}
						Err(tokio::sync::broadcast::error::RecvError::Closed) => {
							warn!("block notification stream closed");
							return;
						}
					},
					_ = backstop.tick() => {
						if let Err(e) = self.scrooge.retry_pending().await {
							warn!("block watcher backstop retry failed: {}", e);
						}
					}
				}
			}
		});
		stop_tx
	}

	/// One sweep: refunds every forward swap whose timeout has passed, per
	/// the tip height just reported (§4.4's literal `timeout <= height`
	/// trigger, with no added margin).
	pub async fn sweep_refundable(&self, height: u32) -> Result<(), Error> {
		for swap in self.store.all_swaps().await? {
			if swap.status.is_terminal() || !swap.lockup_observed() {
				continue;
			}
			if swap.refundable_at(height) {
				info!("swap {} refundable at height {}", swap.id, height);
				if let Err(e) = self.scrooge.submit_refund(swap.id.clone()).await {
					warn!("submitting refund for swap {}: {}", swap.id, e);
					continue;
				}
				self.nursery.stop(&swap.id).await;
			}
		}
		Ok(())
	}

	/// Convenience used by recovery-at-startup and tests: sweeps against the
	/// chain backend's own current tip rather than waiting for the next
	/// pushed notification.
	pub async fn sweep_refundable_now(&self) -> Result<(), Error> {
		let height = self.chain.current_height().await?;
		self.sweep_refundable(height).await
	}
}
