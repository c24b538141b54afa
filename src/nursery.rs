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

//! Component C: the swap nursery. Owns one background task per registered
//! swap, dispatching the exchange's status events against each swap's
//! partial order (§4.3) and driving the batcher and local Lightning node as
//! a swap progresses. This is the composition root: the handful of public
//! methods here are the whole surface the rest of a program touches.

use crate::clients::{ChainClient, ExchangeClient, InvoiceState, LnClient, Store};
use crate::config::NurseryConfig;
use crate::error::{Error, ErrorKind};
use crate::model::{ReverseSwap, Swap};
use crate::registry::CancellationRegistry;
use crate::scrooge::Scrooge;
use crate::status::Status;
use crate::SwapId;
use bitcoin::hashes::{sha256, Hash};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// The payment hash a forward swap's invoice carries, derived locally from
/// the preimage we already hold rather than by decoding the invoice string
/// (BOLT11 parsing is out of scope).
fn payment_hash(preimage: &[u8]) -> [u8; 32] {
	sha256::Hash::hash(preimage).to_byte_array()
}

/// Ties the external collaborators together and owns the swap registry.
/// Cloned handles of this are what each spawned task closes over, so it is
/// always used behind an `Arc`.
pub struct Nursery {
	exchange: Arc<dyn ExchangeClient>,
	chain: Arc<dyn ChainClient>,
	ln: Arc<dyn LnClient>,
	store: Arc<dyn Store>,
	scrooge: Arc<Scrooge>,
	registry: CancellationRegistry,
	config: NurseryConfig,
}

impl Nursery {
	pub fn new(
		exchange: Arc<dyn ExchangeClient>,
		chain: Arc<dyn ChainClient>,
		ln: Arc<dyn LnClient>,
		store: Arc<dyn Store>,
		scrooge: Arc<Scrooge>,
		config: NurseryConfig,
	) -> Arc<Self> {
		Arc::new(Nursery {
			exchange,
			chain,
			ln,
			store,
			scrooge,
			registry: CancellationRegistry::new(),
			config,
		})
	}

	/// Persists a newly-created forward swap and starts watching it.
	pub async fn register_swap(self: &Arc<Self>, swap: Swap) -> Result<(), Error> {
		let id = swap.id.clone();
		self.store.save_swap(&swap).await?;
		self.spawn_forward(id).await
	}

	/// Persists a newly-created reverse swap, pays the triggering invoice,
	/// and starts watching it.
	pub async fn register_reverse_swap(self: &Arc<Self>, swap: ReverseSwap) -> Result<(), Error> {
		let id = swap.id.clone();
		let invoice = swap.invoice.clone();
		self.store.save_reverse_swap(&swap).await?;

		let ln = self.ln.clone();
		let nursery = self.clone();
		let pay_id = id.clone();
		tokio::spawn(async move {
			if let Err(e) = ln.pay_invoice(&invoice).await {
				warn!("paying invoice for reverse swap {} failed: {}", pay_id, e);
				if let Ok(Some(mut swap)) = nursery.store.load_reverse_swap(&pay_id).await {
					if swap.status.advances_reverse(Status::SwapAbandoned) {
						swap.status = Status::SwapAbandoned;
						let _ = nursery.store.save_reverse_swap(&swap).await;
					}
				}
			}
		});

		self.spawn_reverse(id).await
	}

	/// Cancels a swap's background task without altering its persisted
	/// status. Used by recovery when a restart finds a swap stuck in a
	/// state it can no longer act on.
	pub async fn stop(&self, id: &SwapId) {
		self.registry.cancel(id).await;
	}

	/// Restarts a swap's background task for an already-persisted swap,
	/// without touching its status. Used by recovery (§4.5): every
	/// non-terminal swap is re-registered unconditionally on startup,
	/// regardless of whether anything actually changed while the process
	/// was down.
	pub async fn resume_swap(self: &Arc<Self>, id: SwapId) -> Result<(), Error> {
		self.spawn_forward(id).await
	}

	/// The reverse-swap equivalent of [`Nursery::resume_swap`]. Does not
	/// re-pay the triggering invoice; recovery only resumes watching.
	pub async fn resume_reverse_swap(self: &Arc<Self>, id: SwapId) -> Result<(), Error> {
		self.spawn_reverse(id).await
	}

	pub async fn running_count(&self) -> usize {
		self.registry.len().await
	}

	/// Dispatches a status reported directly by the exchange (rather than
	/// arriving off the subscribed event stream) through the same partial
	/// order a live event would go through. Used by recovery (§4.5) to
	/// reconcile a swap whose status changed while the process was down,
	/// before deciding whether to resume watching it.
	pub async fn dispatch_forward_status(
		&self,
		id: &SwapId,
		status: Status,
		transaction_id: Option<bitcoin::Txid>,
	) -> Result<(), Error> {
		self.handle_forward_event(id, status, transaction_id).await
	}

	/// The reverse-swap equivalent of [`Nursery::dispatch_forward_status`].
	pub async fn dispatch_reverse_status(
		&self,
		id: &SwapId,
		status: Status,
		transaction_id: Option<bitcoin::Txid>,
	) -> Result<(), Error> {
		self.handle_reverse_event(id, status, transaction_id).await
	}

	async fn spawn_forward(self: &Arc<Self>, id: SwapId) -> Result<(), Error> {
		let mut cancel = self.registry.register(id.clone()).await;
		let mut status_rx = self.exchange.subscribe_status().await?;
		let nursery = self.clone();

		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = &mut cancel => {
						debug!("forward swap {} cancelled", id);
						return;
					}
					event = status_rx.recv() => match event {
						Ok(event) if event.swap_id == id => {
							if let Err(e) = nursery.handle_forward_event(&id, event.status, event.transaction_id).await {
								warn!("handling event for swap {}: {}", id, e);
							}
							if nursery.forward_is_terminal(&id).await {
								nursery.registry.deregister(&id).await;
								return;
							}
						}
						Ok(_) => continue,
						Err(RecvError::Lagged(skipped)) => {
							warn!("status stream lagged {} events, continuing", skipped);
							continue;
						}
						Err(RecvError::Closed) => {
							warn!("status stream closed while watching swap {}", id);
							return;
						}
					},
				}
			}
		});
		Ok(())
	}

	async fn spawn_reverse(self: &Arc<Self>, id: SwapId) -> Result<(), Error> {
		let mut cancel = self.registry.register(id.clone()).await;
		let mut status_rx = self.exchange.subscribe_status().await?;
		let nursery = self.clone();

		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = &mut cancel => {
						debug!("reverse swap {} cancelled", id);
						return;
					}
					event = status_rx.recv() => match event {
						Ok(event) if event.swap_id == id => {
							if let Err(e) = nursery.handle_reverse_event(&id, event.status, event.transaction_id).await {
								warn!("handling event for reverse swap {}: {}", id, e);
							}
							if nursery.reverse_is_terminal(&id).await {
								nursery.registry.deregister(&id).await;
								return;
							}
						}
						Ok(_) => continue,
						Err(RecvError::Lagged(skipped)) => {
							warn!("status stream lagged {} events, continuing", skipped);
							continue;
						}
						Err(RecvError::Closed) => {
							warn!("status stream closed while watching reverse swap {}", id);
							return;
						}
					},
				}
			}
		});
		Ok(())
	}

	async fn forward_is_terminal(&self, id: &SwapId) -> bool {
		matches!(self.store.load_swap(id).await, Ok(Some(swap)) if swap.status.is_terminal())
	}

	async fn reverse_is_terminal(&self, id: &SwapId) -> bool {
		matches!(self.store.load_reverse_swap(id).await, Ok(Some(swap)) if swap.status.is_terminal())
	}

	async fn handle_forward_event(
		&self,
		id: &SwapId,
		status: Status,
		transaction_id: Option<bitcoin::Txid>,
	) -> Result<(), Error> {
		let mut swap = self
			.store
			.load_swap(id)
			.await?
			.ok_or_else(|| ErrorKind::Protocol(format!("event for unknown swap {}", id)))?;

		// Invariant 1: a regression or lateral repeat is dropped silently,
		// not treated as an error.
		if !swap.status.advances_forward(status) {
			debug!("swap {} dropping non-advancing status {:?}", id, status);
			return Ok(());
		}

		match status {
			Status::TransactionMempool | Status::TransactionConfirmed => {
				if swap.lockup_transaction_id.is_none() {
					swap.lockup_transaction_id = transaction_id;
				}

				// Best-effort: an unreachable peer does not abandon the
				// swap, the invoice below may still route without a direct
				// channel.
				if let Err(e) = self.ln.connect_peer(&self.config.exchange_node_pubkey).await {
					debug!("connecting to exchange node for swap {}: {}", id, e);
				}

				if swap.invoice.is_none() {
					let rate = self.exchange.swap_rates(id).await?;
					let info = self.ln.get_info().await?;
					let remaining_blocks = swap.timeout_block_height.saturating_sub(info.block_height);
					let expiry_secs = (remaining_blocks as u64 * self.config.average_block_time_secs).max(1);
					let memo = format!("swap {}", id);
					let invoice = self
						.ln
						.add_invoice(rate.invoice_amount_sat, &swap.preimage.0, expiry_secs, &memo)
						.await?;
					self.exchange.set_invoice(id, &invoice).await?;
					swap.invoice = Some(invoice);
				}
			}
			Status::ChannelCreated => {
				if let Some(channel_creation) = swap.channel_creation.as_mut() {
					if let Some(txid) = transaction_id {
						// Trust the local node's own pending-channel view,
						// matched on both funding point and peer pubkey,
						// rather than the exchange's uncross-checked report.
						let pending = self.ln.pending_channels().await?;
						let channel = pending
							.iter()
							.find(|c| c.funding_txid == txid && c.remote_pubkey == self.config.exchange_node_pubkey)
							.ok_or_else(|| {
								ErrorKind::Protocol(format!(
									"no local pending channel from {} matches reported funding {} for swap {}",
									self.config.exchange_node_pubkey, txid, id
								))
							})?;

						let tx = self.chain.fetch_transaction(txid).await?;
						let funded = tx
							.output
							.get(channel.funding_vout as usize)
							.map(|out| out.value.to_sat())
							.ok_or_else(|| ErrorKind::Protocol("funding vout out of range".to_string()))?;

						let required = channel_creation.required_capacity();
						if funded < required {
							return Err(ErrorKind::Protocol(format!(
								"channel creation for {} underfunded: {} < {}",
								id, funded, required
							))
							.into());
						}
						channel_creation.funding_outpoint = Some((txid, channel.funding_vout));
					}
				}
			}
			Status::TransactionClaimed => {
				let hash = payment_hash(&swap.preimage.0);
				match self.ln.lookup_invoice(&hash).await {
					Ok(InvoiceState::Settled) => {
						info!("swap {} claimed, local invoice confirmed settled", id);
					}
					Ok(other) => {
						warn!(
							"swap {} reported claimed but local invoice is {:?}, awaiting refund flow",
							id, other
						);
					}
					Err(e) => {
						warn!("swap {} could not verify invoice settlement: {}, awaiting refund flow", id, e);
					}
				}
			}
			Status::SwapRefunded | Status::SwapExpired | Status::SwapAbandoned => {
				info!("swap {} reached terminal status {:?}", id, status);
			}
			_ => {}
		}

		swap.status = status;
		self.store.save_swap(&swap).await?;

		if status == Status::InvoiceFailedToPay {
			let height = self.chain.current_height().await?;
			if swap.refundable_at(height) {
				self.scrooge.submit_refund(id.clone()).await?;
			}
		}

		Ok(())
	}

	async fn handle_reverse_event(
		&self,
		id: &SwapId,
		status: Status,
		transaction_id: Option<bitcoin::Txid>,
	) -> Result<(), Error> {
		let mut swap = self
			.store
			.load_reverse_swap(id)
			.await?
			.ok_or_else(|| ErrorKind::Protocol(format!("event for unknown reverse swap {}", id)))?;

		if !swap.status.advances_reverse(status) {
			debug!("reverse swap {} dropping non-advancing status {:?}", id, status);
			return Ok(());
		}

		if let Some(txid) = transaction_id {
			if swap.lockup_transaction_id.is_none() {
				swap.lockup_transaction_id = Some(txid);
			}
		}

		let mut should_claim = match status {
			Status::TransactionMempool => swap.accept_zero_conf,
			Status::TransactionConfirmed => true,
			_ => false,
		};

		if should_claim {
			if let Some(txid) = swap.lockup_transaction_id {
				let tx = self.chain.fetch_transaction(txid).await?;
				let paid = tx
					.output
					.iter()
					.find(|out| out.script_pubkey == swap.claim_address.script_pubkey())
					.map(|out| out.value.to_sat())
					.unwrap_or(0);
				if paid < swap.onchain_amount_sat {
					warn!(
						"reverse swap {} lockup underpaid: {} < {}, withholding claim",
						id, paid, swap.onchain_amount_sat
					);
					should_claim = false;
				}
			}
		}

		swap.status = status;
		self.store.save_reverse_swap(&swap).await?;

		if should_claim {
			self.scrooge.submit_claim(id.clone()).await?;
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clients::fakes::{FakeChainClient, FakeExchangeClient, FakeLnClient, FakeStore};
	use crate::clients::StatusEvent;
	use crate::model::{Preimage, Swap};
	use crate::tx_builder::OutputType;
	use bitcoin::{Network, PrivateKey};

	fn dummy_key() -> PrivateKey {
		PrivateKey::from_slice(&[3u8; 32], Network::Regtest).unwrap()
	}

	fn test_nursery() -> (Arc<Nursery>, Arc<FakeExchangeClient>, Arc<FakeStore>) {
		let exchange = Arc::new(FakeExchangeClient::new());
		let chain = Arc::new(FakeChainClient::new());
		let ln = Arc::new(FakeLnClient::new(vec![1u8; 32]));
		let store = Arc::new(FakeStore::new());
		let scrooge = Arc::new(Scrooge::new(chain.clone(), store.clone(), ln.clone(), NurseryConfig::default()));
		let nursery = Nursery::new(
			exchange.clone(),
			chain,
			ln,
			store.clone(),
			scrooge,
			NurseryConfig::default(),
		);
		(nursery, exchange, store)
	}

	fn sample_swap(id: &str) -> Swap {
		let script = bitcoin::ScriptBuf::from_bytes(vec![0x51]);
		let address = OutputType::NativeSegWit.lockup_address(&script, Network::Regtest);
		Swap {
			id: SwapId::from(id),
			preimage: Preimage(vec![]),
			redeem_script: script.into_bytes(),
			output_type: OutputType::NativeSegWit,
			private_key: dummy_key(),
			lockup_address: address,
			lockup_transaction_id: None,
			invoice: Some("lnbcrt1...".to_string()),
			refund_transaction_id: None,
			timeout_block_height: 100,
			status: Status::Created,
			channel_creation: None,
		}
	}

	#[tokio::test]
	async fn registering_a_swap_starts_a_watcher_task() {
		let (nursery, _exchange, _store) = test_nursery();
		nursery.register_swap(sample_swap("swap-a")).await.unwrap();
		assert_eq!(nursery.running_count().await, 1);
	}

	#[tokio::test]
	async fn regression_event_is_dropped_without_error() {
		let (nursery, exchange, store) = test_nursery();
		let mut swap = sample_swap("swap-b");
		swap.status = Status::TransactionConfirmed;
		store.save_swap(&swap).await.unwrap();
		nursery.register_swap(swap.clone()).await.unwrap();

		exchange
			.sender()
			.send(StatusEvent {
				swap_id: swap.id.clone(),
				status: Status::InvoiceSet,
				transaction_id: None,
			})
			.unwrap();

		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		let persisted = store.load_swap(&swap.id).await.unwrap().unwrap();
		assert_eq!(persisted.status, Status::TransactionConfirmed);
	}

	#[tokio::test]
	async fn terminal_event_stops_the_task() {
		let (nursery, exchange, store) = test_nursery();
		let swap = sample_swap("swap-c");
		nursery.register_swap(swap.clone()).await.unwrap();

		exchange
			.sender()
			.send(StatusEvent {
				swap_id: swap.id.clone(),
				status: Status::SwapAbandoned,
				transaction_id: None,
			})
			.unwrap();

		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		let persisted = store.load_swap(&swap.id).await.unwrap().unwrap();
		assert!(persisted.status.is_terminal());
		assert_eq!(nursery.running_count().await, 0);
	}
}
