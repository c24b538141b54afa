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

//! Tunables for the nursery and batcher, gathered in one place the way the
//! teacher's `WalletConfig` gathers wallet-wide settings.

use bitcoin::Network;

/// Configuration for a running [`crate::nursery::Nursery`] (§4, §7).
#[derive(Debug, Clone)]
pub struct NurseryConfig {
	/// Chain the nursery operates on. Anything other than Bitcoin mainnet
	/// or testnet is out of scope (§7 Non-goals); callers that need
	/// Litecoin or Liquid parameters supply their own validated `Network`
	/// and script-construction, this crate just needs network identity to
	/// derive addresses correctly.
	pub network: Network,

	/// Below this value in satoshis a batch output is refused rather than
	/// broadcast (§4.1 dust check, §7 Open Questions).
	pub dust_limit_sat: u64,

	/// Minimum confirmations the watcher waits for before treating a
	/// reported lockup as final for a non-zero-conf reverse swap.
	pub min_lockup_confirmations: u32,

	/// How often the batcher retries building a batch out of whatever is
	/// still pending, as a backstop against a missed trigger - refunds
	/// themselves are driven by the block-height listener, not this timer
	/// (§4.4, §6 `register_block_listener`).
	pub batch_poll_interval_secs: u64,

	/// The exchange's own Lightning node pubkey, connected to before
	/// issuing a forward swap's triggering invoice and cross-checked
	/// against local pending channels before trusting a reported
	/// channel-creation funding point (§4.3).
	pub exchange_node_pubkey: String,

	/// Average seconds between blocks on the configured network, used to
	/// convert a swap's remaining blocks into an invoice expiry (§4.3
	/// `TransactionMempool`/`TransactionConfirmed`).
	pub average_block_time_secs: u64,
}

impl Default for NurseryConfig {
	fn default() -> Self {
		NurseryConfig {
			network: Network::Bitcoin,
			dust_limit_sat: 546,
			min_lockup_confirmations: 1,
			batch_poll_interval_secs: 30,
			exchange_node_pubkey: String::new(),
			average_block_time_secs: 600,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_is_mainnet_with_conservative_defaults() {
		let config = NurseryConfig::default();
		assert_eq!(config.network, Network::Bitcoin);
		assert_eq!(config.dust_limit_sat, 546);
		assert_eq!(config.average_block_time_secs, 600);
	}
}
