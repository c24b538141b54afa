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

//! The status enum shared by forward and reverse swaps, the exchange's wire
//! label table (§6), and the partial orders each swap kind advances through
//! (§4.3, §8).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal representation of every status the exchange's event stream can
/// report, for either swap direction. Forward and reverse swaps only ever
/// occupy the subset of these relevant to their own partial order; see
/// [`Status::advances_forward`] / [`Status::advances_reverse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
	Created,
	InvoiceSet,
	TransactionMempool,
	TransactionConfirmed,
	InvoiceFailedToPay,
	ChannelCreated,
	InvoicePending,
	InvoicePaid,
	TransactionClaimed,
	InvoiceSettled,
	SwapAbandoned,
	SwapExpired,
	SwapRefunded,
}

impl fmt::Display for Status {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}", self)
	}
}

impl Status {
	/// Maps an exchange wire label (§6) to the internal enum. Unrecognized
	/// labels map to `SwapAbandoned`, never to an error - the nursery has no
	/// way to ask the exchange to clarify, so it abandons the swap rather
	/// than stalling on it forever.
	pub fn parse_event(label: &str) -> Status {
		match label {
			"transaction.mempool" => Status::TransactionMempool,
			"transaction.confirmed" => Status::TransactionConfirmed,
			"transaction.claimed" => Status::TransactionClaimed,
			"channel.created" => Status::ChannelCreated,
			"invoice.set" => Status::InvoiceSet,
			"invoice.pending" => Status::InvoicePending,
			"invoice.settled" => Status::InvoiceSettled,
			"invoice.failedToPay" => Status::InvoiceFailedToPay,
			"swap.expired" => Status::SwapExpired,
			"swap.refunded" => Status::SwapRefunded,
			_ => Status::SwapAbandoned,
		}
	}

	/// Terminal for either swap direction: no longer subscribed, retained
	/// only for audit (§3 Lifecycles).
	pub fn is_terminal(self) -> bool {
		matches!(
			self,
			Status::TransactionClaimed
				| Status::InvoiceSettled
				| Status::SwapRefunded
				| Status::SwapExpired
				| Status::SwapAbandoned
		)
	}

	fn forward_rank(self) -> Option<u8> {
		match self {
			Status::Created => Some(0),
			Status::InvoiceSet => Some(1),
			Status::TransactionMempool => Some(2),
			Status::TransactionConfirmed => Some(3),
			Status::InvoiceFailedToPay => Some(4),
			Status::ChannelCreated => Some(4),
			Status::InvoicePaid => Some(5),
			Status::TransactionClaimed => Some(6),
			// Lateral terminals always advance from any non-terminal state.
			Status::SwapAbandoned | Status::SwapExpired | Status::SwapRefunded => Some(u8::MAX),
			_ => None,
		}
	}

	fn reverse_rank(self) -> Option<u8> {
		match self {
			Status::Created => Some(0),
			Status::TransactionMempool => Some(1),
			Status::TransactionConfirmed => Some(2),
			Status::InvoicePending => Some(3),
			Status::InvoiceSettled => Some(4),
			Status::SwapAbandoned | Status::SwapExpired | Status::SwapRefunded => Some(u8::MAX),
			_ => None,
		}
	}

	/// True if transitioning a forward swap from `self` to `next` is an
	/// advance along §4.3's partial order. A transition to an unranked
	/// status, or a rank that does not increase, is rejected - the caller
	/// drops it idempotently rather than erroring (invariant 1).
	pub fn advances_forward(self, next: Status) -> bool {
		match (self.forward_rank(), next.forward_rank()) {
			(Some(from), Some(to)) => to > from || to == u8::MAX,
			_ => false,
		}
	}

	/// True if transitioning a reverse swap from `self` to `next` is an
	/// advance along §4.3's partial order.
	pub fn advances_reverse(self, next: Status) -> bool {
		match (self.reverse_rank(), next.reverse_rank()) {
			(Some(from), Some(to)) => to > from || to == u8::MAX,
			_ => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wire_table_matches_spec() {
		assert_eq!(Status::parse_event("transaction.mempool"), Status::TransactionMempool);
		assert_eq!(Status::parse_event("transaction.confirmed"), Status::TransactionConfirmed);
		assert_eq!(Status::parse_event("transaction.claimed"), Status::TransactionClaimed);
		assert_eq!(Status::parse_event("channel.created"), Status::ChannelCreated);
		assert_eq!(Status::parse_event("invoice.set"), Status::InvoiceSet);
		assert_eq!(Status::parse_event("invoice.pending"), Status::InvoicePending);
		assert_eq!(Status::parse_event("invoice.settled"), Status::InvoiceSettled);
		assert_eq!(Status::parse_event("invoice.failedToPay"), Status::InvoiceFailedToPay);
		assert_eq!(Status::parse_event("swap.expired"), Status::SwapExpired);
		assert_eq!(Status::parse_event("swap.refunded"), Status::SwapRefunded);
		assert_eq!(Status::parse_event("something-unknown"), Status::SwapAbandoned);
	}

	#[test]
	fn forward_partial_order_rejects_regression() {
		assert!(Status::Created.advances_forward(Status::InvoiceSet));
		assert!(Status::InvoiceSet.advances_forward(Status::TransactionMempool));
		assert!(!Status::TransactionConfirmed.advances_forward(Status::InvoiceSet));
		assert!(!Status::TransactionMempool.advances_forward(Status::TransactionMempool));
	}

	#[test]
	fn lateral_terminals_always_advance() {
		assert!(Status::TransactionMempool.advances_forward(Status::SwapRefunded));
		assert!(Status::Created.advances_reverse(Status::SwapAbandoned));
	}

	#[test]
	fn reverse_partial_order_rejects_regression() {
		assert!(Status::Created.advances_reverse(Status::TransactionMempool));
		assert!(!Status::InvoiceSettled.advances_reverse(Status::TransactionMempool));
	}
}
