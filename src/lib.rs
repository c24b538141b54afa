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

//! A state-machine nursery and fee-aware transaction batcher for
//! on-chain/off-chain atomic swaps.
//!
//! [`nursery::Nursery`] is the composition root: it owns one background
//! task per registered swap, dispatches the exchange's status events
//! against each swap's partial order, and hands off to [`scrooge::Scrooge`]
//! (the batcher) and [`watcher::Watcher`] (the timeout sweep) as swaps
//! progress. [`recovery::recover`] reconciles persisted state with running
//! tasks once at startup.

pub mod clients;
pub mod config;
pub mod error;
pub mod model;
pub mod nursery;
pub mod recovery;
pub mod registry;
pub mod scrooge;
pub mod status;
pub mod tx_builder;
pub mod watcher;

pub use config::NurseryConfig;
pub use error::{Error, ErrorKind};
pub use model::{ChannelCreation, Preimage, ReverseSwap, Swap, SwapId, UnconfirmedBatch};
pub use nursery::Nursery;
pub use scrooge::Scrooge;
pub use status::Status;
pub use watcher::Watcher;
