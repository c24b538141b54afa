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

//! Component E: startup recovery. Runs once, before anything else accepts
//! new swaps: every persisted, non-terminal swap is reconciled against the
//! exchange's own current view of it before its background task is
//! resumed, mirroring `recoverSwaps`/`recoverReverseSwaps` (§4.5). If the
//! exchange's status differs from what was persisted, the difference is
//! dispatched through the same partial order a live event would take,
//! which may itself bring the swap to a terminal state - in that case
//! nothing is resumed. A swap the exchange cannot currently be reached
//! about is left alone rather than guessed at; it will be retried on the
//! next restart.

use crate::clients::{ExchangeClient, Store};
use crate::error::Error;
use crate::nursery::Nursery;
use log::{info, warn};
use std::sync::Arc;

/// Reconciles persisted state with the exchange's current view, then
/// resumes whichever swaps are still non-terminal. Returns the count of
/// forward and reverse swaps resumed, for startup logging.
pub async fn recover(
	nursery: &Arc<Nursery>,
	store: &Arc<dyn Store>,
	exchange: &Arc<dyn ExchangeClient>,
) -> Result<(usize, usize), Error> {
	let mut forward_resumed = 0;
	for swap in store.all_swaps().await? {
		if swap.status.is_terminal() {
			continue;
		}
		info!("recovering forward swap {} (status {:?})", swap.id, swap.status);

		let current = match exchange.get_swap_status(&swap.id).await {
			Ok(status) => status,
			Err(e) => {
				warn!("could not fetch exchange status for swap {}: {}", swap.id, e);
				continue;
			}
		};

		if current != swap.status {
			info!("swap {} status changed to {:?} while offline", swap.id, current);
			if let Err(e) = nursery.dispatch_forward_status(&swap.id, current, None).await {
				warn!("reconciling swap {}: {}", swap.id, e);
			}
			let completed = matches!(store.load_swap(&swap.id).await, Ok(Some(s)) if s.status.is_terminal());
			if completed {
				continue;
			}
		} else {
			info!("swap {} status did not change", swap.id);
		}

		if let Err(e) = nursery.resume_swap(swap.id.clone()).await {
			warn!("failed to resume forward swap {}: {}", swap.id, e);
			continue;
		}
		forward_resumed += 1;
	}

	let mut reverse_resumed = 0;
	for swap in store.all_reverse_swaps().await? {
		if swap.status.is_terminal() {
			continue;
		}
		info!("recovering reverse swap {} (status {:?})", swap.id, swap.status);

		let current = match exchange.get_swap_status(&swap.id).await {
			Ok(status) => status,
			Err(e) => {
				warn!("could not fetch exchange status for reverse swap {}: {}", swap.id, e);
				continue;
			}
		};

		if current != swap.status {
			info!("reverse swap {} status changed to {:?} while offline", swap.id, current);
			if let Err(e) = nursery.dispatch_reverse_status(&swap.id, current, None).await {
				warn!("reconciling reverse swap {}: {}", swap.id, e);
			}
			let completed = matches!(store.load_reverse_swap(&swap.id).await, Ok(Some(s)) if s.status.is_terminal());
			if completed {
				continue;
			}
		} else {
			info!("reverse swap {} status did not change", swap.id);
		}

		if let Err(e) = nursery.resume_reverse_swap(swap.id.clone()).await {
			warn!("failed to resume reverse swap {}: {}", swap.id, e);
			continue;
		}
		reverse_resumed += 1;
	}

	Ok((forward_resumed, reverse_resumed))
}
