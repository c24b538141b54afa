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

//! The persisted data model (§3): forward swaps, reverse swaps, channel
//! creations and the singleton unconfirmed-batch record.

use crate::status::Status;
use crate::tx_builder::OutputType;
use bitcoin::{Address, PrivateKey, Txid};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque id assigned by the exchange. Modeled as a newtype over `String`
/// rather than the teacher's `Uuid`, since these ids are assigned by a
/// remote counterparty, not generated locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwapId(pub String);

impl fmt::Display for SwapId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<&str> for SwapId {
	fn from(s: &str) -> SwapId {
		SwapId(s.to_string())
	}
}

impl From<String> for SwapId {
	fn from(s: String) -> SwapId {
		SwapId(s)
	}
}

/// The secret whose hash appears in both the redeem script and the
/// Lightning invoice (GLOSSARY: Preimage). 32 bytes, generated locally for
/// reverse swaps.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preimage(pub Vec<u8>);

impl fmt::Debug for Preimage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Preimage({})", hex::encode(&self.0))
	}
}

/// A channel-creation's extra bookkeeping (§3): the inbound-liquidity
/// fraction negotiated at registration time, and the funding outpoint once
/// the exchange's channel opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCreation {
	pub swap_id: SwapId,
	/// Fraction of the channel's capacity (`0.0..1.0`) the exchange commits
	/// to provide as inbound liquidity.
	pub inbound_liquidity_fraction: f64,
	/// Amount of the invoice this channel is being opened to let us
	/// receive, fixed at registration time.
	pub invoice_amount_sat: u64,
	/// Set once `ChannelCreated` is observed and capacity is verified.
	pub funding_outpoint: Option<(Txid, u32)>,
}

impl ChannelCreation {
	/// The minimum channel capacity that satisfies the inbound-liquidity
	/// commitment for [`ChannelCreation::invoice_amount_sat`] (§4.3
	/// `ChannelCreated`): `ceil(invoiceAmount / (1 - inboundLiquidityFraction))`.
	pub fn required_capacity(&self) -> u64 {
		let denom = (1.0 - self.inbound_liquidity_fraction).max(f64::EPSILON);
		(self.invoice_amount_sat as f64 / denom).ceil() as u64
	}
}

/// A forward swap: on-chain funds in, off-chain payment out (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Swap {
	pub id: SwapId,
	pub preimage: Preimage,
	pub redeem_script: Vec<u8>,
	pub output_type: OutputType,
	pub private_key: PrivateKey,
	pub lockup_address: Address,
	pub lockup_transaction_id: Option<Txid>,
	pub invoice: Option<String>,
	pub refund_transaction_id: Option<Txid>,
	pub timeout_block_height: u32,
	pub status: Status,
	pub channel_creation: Option<ChannelCreation>,
}

impl Swap {
	pub fn is_channel_creation(&self) -> bool {
		self.channel_creation.is_some()
	}

	/// Invariant 3: a swap without an observed lockup must not have a spend
	/// id yet.
	pub fn lockup_observed(&self) -> bool {
		self.lockup_transaction_id.is_some()
	}

	/// Invariant 6: a swap may only be refunded at or after its timeout.
	pub fn refundable_at(&self, height: u32) -> bool {
		!self.status.is_terminal() && height >= self.timeout_block_height
	}
}

/// A reverse swap: off-chain payment in, on-chain funds out (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseSwap {
	pub id: SwapId,
	pub preimage: Preimage,
	pub redeem_script: Vec<u8>,
	pub output_type: OutputType,
	pub private_key: PrivateKey,
	pub claim_address: Address,
	/// The BOLT11 invoice we pay to trigger this swap. Settlement of that
	/// payment is what causes the exchange to publish the lockup we then
	/// watch for (§4.3).
	pub invoice: String,
	pub lockup_transaction_id: Option<Txid>,
	pub claim_transaction_id: Option<Txid>,
	pub onchain_amount_sat: u64,
	pub accept_zero_conf: bool,
	pub status: Status,
}

/// The singleton unconfirmed-batch record (§3, invariant 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnconfirmedBatch {
	pub transaction_id: Txid,
	pub vsize: u64,
	pub fee_sat: u64,
}
