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

//! External collaborator traits (§5): the exchange's event stream, the chain
//! backend, the Lightning node, and the persistence layer. No concrete HTTP,
//! SSE, RPC or SQL implementation ships here; those wire protocols are
//! out of scope. Test code gets in-memory fakes behind `#[cfg(test)]`.

use crate::error::Error;
use crate::model::{ReverseSwap, Swap, UnconfirmedBatch};
use crate::status::Status;
use crate::SwapId;
use async_trait::async_trait;
use bitcoin::{ScriptBuf, Transaction, Txid};

/// One status change reported by the exchange, for either swap direction.
/// `transaction_id` accompanies the statuses that introduce or confirm a
/// transaction (`transaction.mempool`, `transaction.confirmed`); it is
/// `None` for purely off-chain statuses like `invoice.settled`.
#[derive(Debug, Clone)]
pub struct StatusEvent {
	pub swap_id: SwapId,
	pub status: Status,
	pub transaction_id: Option<Txid>,
}

/// The invoice amount the exchange expects for a forward swap's triggering
/// invoice, returned by `swap_rates` (§4.3 `TransactionMempool`/
/// `TransactionConfirmed`).
#[derive(Debug, Clone, Copy)]
pub struct SwapRate {
	pub invoice_amount_sat: u64,
}

/// The local Lightning node's own view of the chain tip, used to derive an
/// invoice's expiry from the swap's remaining blocks.
#[derive(Debug, Clone, Copy)]
pub struct LnNodeInfo {
	pub block_height: u32,
}

/// One channel the local node currently has open or opening, as reported by
/// its own pending-channels view - never the exchange's.
#[derive(Debug, Clone)]
pub struct PendingChannel {
	pub remote_pubkey: String,
	pub funding_txid: Txid,
	pub funding_vout: u32,
}

/// The settlement state of a locally-created invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceState {
	Open,
	Settled,
	Cancelled,
}

/// The exchange's side of the protocol: a single multiplexed event stream,
/// subscribed to once at startup (mirrors the Go original's global status
/// websocket rather than a per-swap subscription), plus the handful of
/// request/response calls the nursery makes against individual swaps.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
	/// Subscribes to every swap's status events. Implementations fan this
	/// out from a single upstream connection; callers filter by id.
	async fn subscribe_status(&self) -> Result<tokio::sync::broadcast::Receiver<StatusEvent>, Error>;

	/// The exchange's current view of a swap's status, used by recovery
	/// (§4.5) to reconcile persisted state against what may have changed
	/// while the process was down.
	async fn get_swap_status(&self, id: &SwapId) -> Result<Status, Error>;

	/// The amount a forward swap's triggering invoice must request (§4.3).
	async fn swap_rates(&self, id: &SwapId) -> Result<SwapRate, Error>;

	/// Hands a locally-generated invoice back to the exchange so it knows
	/// what to pay to release a forward swap's on-chain lockup (§4.3).
	async fn set_invoice(&self, id: &SwapId, invoice: &str) -> Result<(), Error>;
}

/// The on-chain backend: fee estimation, broadcast, and confirmation lookup.
#[async_trait]
pub trait ChainClient: Send + Sync {
	/// Current chain tip height, used by the watcher (§4.4) and recovery.
	async fn current_height(&self) -> Result<u32, Error>;

	/// Fetches a transaction by id, e.g. to inspect a reported lockup.
	async fn fetch_transaction(&self, txid: Txid) -> Result<Transaction, Error>;

	/// True once `txid` has at least one confirmation. A `Transient` error
	/// here means try again on the next event, not that the tx is missing.
	async fn transaction_is_confirmed(&self, txid: Txid) -> Result<bool, Error>;

	/// Locates the output index paying `script_pubkey` in `txid` (mirrors
	/// the Go original's `FindLockupVout`). `Protocol` error if absent.
	async fn find_lockup_vout(&self, txid: Txid, script_pubkey: &ScriptBuf) -> Result<u32, Error>;

	/// Current fee estimate in sat/kW, as reported by the backend's fee
	/// estimator (§4.1 converts this to sat/vbyte via `/4000`).
	async fn fee_estimate_sat_per_kw(&self) -> Result<u64, Error>;

	/// Broadcasts `tx`, replacing any previous unconfirmed batch. A
	/// `Broadcast` error means the caller should retry with a higher fee.
	async fn broadcast(&self, tx: &Transaction) -> Result<Txid, Error>;
}

/// The local Lightning node: invoice payment and issuance, peer connectivity
/// to the exchange's node, and the node's own view of its pending channels
/// and chain tip. Channel capacity for channel-creation swaps is opened by
/// the exchange, not us; the nursery only verifies it (§4.3
/// `ChannelCreated`), so no channel-open call belongs on this trait.
#[async_trait]
pub trait LnClient: Send + Sync {
	/// Pays a BOLT11 invoice, returning the preimage the exchange expects to
	/// see in the resulting claim transaction's witness.
	async fn pay_invoice(&self, invoice: &str) -> Result<Vec<u8>, Error>;

	/// Best-effort connection to the exchange's node, so the invoice this
	/// node is about to issue is reachable without relying on the public
	/// graph alone (§4.3). Failures are not fatal to the caller.
	async fn connect_peer(&self, node_pubkey: &str) -> Result<(), Error>;

	/// This node's own view of its chain tip, used to derive an invoice's
	/// expiry from a swap's remaining blocks.
	async fn get_info(&self) -> Result<LnNodeInfo, Error>;

	/// Creates an invoice for `amount_sat` with payment hash
	/// `sha256(preimage)`, expiring in `expiry_secs`. The exchange pays this
	/// invoice to release a forward swap's on-chain lockup, which is how its
	/// settlement becomes visible to this node as proof of payment (§4.3).
	async fn add_invoice(&self, amount_sat: u64, preimage: &[u8], expiry_secs: u64, memo: &str) -> Result<String, Error>;

	/// The settlement state of a previously-created invoice, looked up by
	/// its payment hash.
	async fn lookup_invoice(&self, payment_hash: &[u8; 32]) -> Result<InvoiceState, Error>;

	/// This node's own pending/open channels, used to cross-check a
	/// channel-creation swap's reported funding point and peer against what
	/// the node has actually negotiated, rather than trusting the exchange's
	/// own report of it (§4.3 `ChannelCreated`).
	async fn pending_channels(&self) -> Result<Vec<PendingChannel>, Error>;

	/// A fresh receive address from the local wallet, requested once per
	/// batch for the refund-consolidation output (§4.2 step 5) so repeated
	/// batches do not all pay the same address.
	async fn new_address(&self) -> Result<bitcoin::Address, Error>;

	/// Subscribes to the node's own block-height notifications. Implementations
	/// fan this out from a single upstream subscription, the same way
	/// `ExchangeClient::subscribe_status` does (§4.4, §6).
	async fn register_block_listener(&self) -> Result<tokio::sync::broadcast::Receiver<u32>, Error>;
}

/// The persistence layer (§3). `replace_unconfirmed_batch` is the one
/// operation that must be atomic: it is the sole writer of the singleton
/// unconfirmed-batch slot, and the caller always passes the value it most
/// recently read so a concurrent writer can be detected (invariant 2).
#[async_trait]
pub trait Store: Send + Sync {
	async fn save_swap(&self, swap: &Swap) -> Result<(), Error>;
	async fn load_swap(&self, id: &SwapId) -> Result<Option<Swap>, Error>;
	async fn all_swaps(&self) -> Result<Vec<Swap>, Error>;

	async fn save_reverse_swap(&self, swap: &ReverseSwap) -> Result<(), Error>;
	async fn load_reverse_swap(&self, id: &SwapId) -> Result<Option<ReverseSwap>, Error>;
	async fn all_reverse_swaps(&self) -> Result<Vec<ReverseSwap>, Error>;

	async fn load_unconfirmed_batch(&self) -> Result<Option<UnconfirmedBatch>, Error>;

	/// Replaces the unconfirmed-batch slot. `expected` must match what is
	/// currently stored, or the call fails with `ErrorKind::Transient` so
	/// the caller reloads and retries rather than clobbering a concurrent
	/// writer.
	async fn replace_unconfirmed_batch(
		&self,
		expected: Option<UnconfirmedBatch>,
		new: Option<UnconfirmedBatch>,
	) -> Result<(), Error>;
}

#[cfg(test)]
pub mod fakes {
	use super::*;
	use crate::error::ErrorKind;
	use std::collections::HashMap;
	use tokio::sync::{broadcast, Mutex};

	/// In-memory [`ExchangeClient`]: tests push events directly onto the
	/// broadcast sender returned by [`FakeExchangeClient::sender`], and
	/// configure `get_swap_status`/`swap_rates` responses explicitly.
	pub struct FakeExchangeClient {
		sender: broadcast::Sender<StatusEvent>,
		pub statuses: Mutex<HashMap<SwapId, Status>>,
		pub rates: Mutex<HashMap<SwapId, SwapRate>>,
		pub set_invoices: Mutex<HashMap<SwapId, String>>,
	}

	impl FakeExchangeClient {
		pub fn new() -> Self {
			let (sender, _) = broadcast::channel(128);
			FakeExchangeClient {
				sender,
				statuses: Mutex::new(HashMap::new()),
				rates: Mutex::new(HashMap::new()),
				set_invoices: Mutex::new(HashMap::new()),
			}
		}

		pub fn sender(&self) -> broadcast::Sender<StatusEvent> {
			self.sender.clone()
		}

		pub async fn set_swap_status(&self, id: SwapId, status: Status) {
			self.statuses.lock().await.insert(id, status);
		}

		pub async fn set_swap_rate(&self, id: SwapId, rate: SwapRate) {
			self.rates.lock().await.insert(id, rate);
		}
	}

	#[async_trait]
	impl ExchangeClient for FakeExchangeClient {
		async fn subscribe_status(&self) -> Result<broadcast::Receiver<StatusEvent>, Error> {
			Ok(self.sender.subscribe())
		}

		async fn get_swap_status(&self, id: &SwapId) -> Result<Status, Error> {
			self.statuses
				.lock()
				.await
				.get(id)
				.copied()
				.ok_or_else(|| ErrorKind::Transient(format!("no exchange-side status configured for {}", id)).into())
		}

		async fn swap_rates(&self, id: &SwapId) -> Result<SwapRate, Error> {
			self.rates
				.lock()
				.await
				.get(id)
				.copied()
				.ok_or_else(|| ErrorKind::Protocol(format!("no swap rate configured for {}", id)).into())
		}

		async fn set_invoice(&self, id: &SwapId, invoice: &str) -> Result<(), Error> {
			self.set_invoices.lock().await.insert(id.clone(), invoice.to_string());
			Ok(())
		}
	}

	/// In-memory [`ChainClient`]: height and confirmation state are test
	/// controlled, broadcast transactions are recorded for assertions.
	pub struct FakeChainClient {
		pub height: Mutex<u32>,
		pub confirmed: Mutex<Vec<Txid>>,
		pub transactions: Mutex<HashMap<Txid, Transaction>>,
		pub broadcasts: Mutex<Vec<Transaction>>,
		pub fee_sat_per_kw: Mutex<u64>,
	}

	impl FakeChainClient {
		pub fn new() -> Self {
			FakeChainClient {
				height: Mutex::new(0),
				confirmed: Mutex::new(Vec::new()),
				transactions: Mutex::new(HashMap::new()),
				broadcasts: Mutex::new(Vec::new()),
				fee_sat_per_kw: Mutex::new(4_000),
			}
		}
	}

	#[async_trait]
	impl ChainClient for FakeChainClient {
		async fn current_height(&self) -> Result<u32, Error> {
			Ok(*self.height.lock().await)
		}

		async fn fetch_transaction(&self, txid: Txid) -> Result<Transaction, Error> {
			self.transactions
				.lock()
				.await
				.get(&txid)
				.cloned()
				.ok_or_else(|| ErrorKind::Protocol(format!("unknown transaction {}", txid)).into())
		}

		async fn transaction_is_confirmed(&self, txid: Txid) -> Result<bool, Error> {
			Ok(self.confirmed.lock().await.contains(&txid))
		}

		async fn find_lockup_vout(&self, txid: Txid, script_pubkey: &ScriptBuf) -> Result<u32, Error> {
			let transactions = self.transactions.lock().await;
			let tx = transactions
				.get(&txid)
				.ok_or_else(|| ErrorKind::Protocol(format!("unknown transaction {}", txid)))?;
			tx.output
				.iter()
				.position(|out| &out.script_pubkey == script_pubkey)
				.map(|index| index as u32)
				.ok_or_else(|| ErrorKind::Protocol("lockup vout not found".to_string()).into())
		}

		async fn fee_estimate_sat_per_kw(&self) -> Result<u64, Error> {
			Ok(*self.fee_sat_per_kw.lock().await)
		}

		async fn broadcast(&self, tx: &Transaction) -> Result<Txid, Error> {
			self.broadcasts.lock().await.push(tx.clone());
			Ok(tx.txid())
		}
	}

	/// In-memory [`LnClient`]: always pays with a fixed preimage unless the
	/// test configures failure. `new_address` hands out a fresh address
	/// every call, `pending_channels`/invoice state are test controlled.
	pub struct FakeLnClient {
		pub preimage: Vec<u8>,
		pub should_fail: Mutex<bool>,
		pub block_height: Mutex<u32>,
		pub pending: Mutex<Vec<PendingChannel>>,
		pub invoices: Mutex<HashMap<[u8; 32], InvoiceState>>,
		pub connected_peers: Mutex<Vec<String>>,
		address_counter: Mutex<u8>,
		block_sender: broadcast::Sender<u32>,
	}

	impl FakeLnClient {
		pub fn new(preimage: Vec<u8>) -> Self {
			let (block_sender, _) = broadcast::channel(16);
			FakeLnClient {
				preimage,
				should_fail: Mutex::new(false),
				block_height: Mutex::new(0),
				pending: Mutex::new(Vec::new()),
				invoices: Mutex::new(HashMap::new()),
				connected_peers: Mutex::new(Vec::new()),
				address_counter: Mutex::new(0),
				block_sender,
			}
		}

		pub fn block_sender(&self) -> broadcast::Sender<u32> {
			self.block_sender.clone()
		}

		/// Marks a previously-issued invoice settled, as if the exchange had
		/// just paid it.
		pub async fn settle_invoice(&self, payment_hash: [u8; 32]) {
			self.invoices.lock().await.insert(payment_hash, InvoiceState::Settled);
		}
	}

	#[async_trait]
	impl LnClient for FakeLnClient {
		async fn pay_invoice(&self, _invoice: &str) -> Result<Vec<u8>, Error> {
			if *self.should_fail.lock().await {
				return Err(ErrorKind::Transient("payment route unavailable".to_string()).into());
			}
			Ok(self.preimage.clone())
		}

		async fn connect_peer(&self, node_pubkey: &str) -> Result<(), Error> {
			self.connected_peers.lock().await.push(node_pubkey.to_string());
			Ok(())
		}

		async fn get_info(&self) -> Result<LnNodeInfo, Error> {
			Ok(LnNodeInfo {
				block_height: *self.block_height.lock().await,
			})
		}

		async fn add_invoice(&self, amount_sat: u64, preimage: &[u8], expiry_secs: u64, memo: &str) -> Result<String, Error> {
			use bitcoin::hashes::{sha256, Hash};
			let hash = sha256::Hash::hash(preimage).to_byte_array();
			self.invoices.lock().await.insert(hash, InvoiceState::Open);
			Ok(format!("lnbcrt{}{}{}", amount_sat, memo, expiry_secs))
		}

		async fn lookup_invoice(&self, payment_hash: &[u8; 32]) -> Result<InvoiceState, Error> {
			self.invoices
				.lock()
				.await
				.get(payment_hash)
				.copied()
				.ok_or_else(|| ErrorKind::Protocol("unknown invoice".to_string()).into())
		}

		async fn pending_channels(&self) -> Result<Vec<PendingChannel>, Error> {
			Ok(self.pending.lock().await.clone())
		}

		async fn new_address(&self) -> Result<bitcoin::Address, Error> {
			let mut counter = self.address_counter.lock().await;
			*counter = counter.wrapping_add(1);
			let script = ScriptBuf::from_bytes(vec![0x51, *counter]);
			Ok(crate::tx_builder::OutputType::NativeSegWit.lockup_address(&script, bitcoin::Network::Regtest))
		}

		async fn register_block_listener(&self) -> Result<broadcast::Receiver<u32>, Error> {
			Ok(self.block_sender.subscribe())
		}
	}

	/// In-memory [`Store`], guarded by a single mutex the way a real
	/// embedded database would serialize access to its own lock file.
	#[derive(Default)]
	struct StoreState {
		swaps: HashMap<SwapId, Swap>,
		reverse_swaps: HashMap<SwapId, ReverseSwap>,
		unconfirmed_batch: Option<UnconfirmedBatch>,
	}

	pub struct FakeStore {
		state: Mutex<StoreState>,
	}

	impl FakeStore {
		pub fn new() -> Self {
			FakeStore {
				state: Mutex::new(StoreState::default()),
			}
		}
	}

	#[async_trait]
	impl Store for FakeStore {
		async fn save_swap(&self, swap: &Swap) -> Result<(), Error> {
			self.state.lock().await.swaps.insert(swap.id.clone(), swap.clone());
			Ok(())
		}

		async fn load_swap(&self, id: &SwapId) -> Result<Option<Swap>, Error> {
			Ok(self.state.lock().await.swaps.get(id).cloned())
		}

		async fn all_swaps(&self) -> Result<Vec<Swap>, Error> {
			Ok(self.state.lock().await.swaps.values().cloned().collect())
		}

		async fn save_reverse_swap(&self, swap: &ReverseSwap) -> Result<(), Error> {
			self.state
				.lock()
				.await
				.reverse_swaps
				.insert(swap.id.clone(), swap.clone());
			Ok(())
		}

		async fn load_reverse_swap(&self, id: &SwapId) -> Result<Option<ReverseSwap>, Error> {
			Ok(self.state.lock().await.reverse_swaps.get(id).cloned())
		}

		async fn all_reverse_swaps(&self) -> Result<Vec<ReverseSwap>, Error> {
			Ok(self.state.lock().await.reverse_swaps.values().cloned().collect())
		}

		async fn load_unconfirmed_batch(&self) -> Result<Option<UnconfirmedBatch>, Error> {
			Ok(self.state.lock().await.unconfirmed_batch.clone())
		}

		async fn replace_unconfirmed_batch(
			&self,
			expected: Option<UnconfirmedBatch>,
			new: Option<UnconfirmedBatch>,
		) -> Result<(), Error> {
			let mut state = self.state.lock().await;
			if state.unconfirmed_batch != expected {
				return Err(ErrorKind::Transient(
					"unconfirmed batch changed concurrently".to_string(),
				)
				.into());
			}
			state.unconfirmed_batch = new;
			Ok(())
		}
	}
}
