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

//! Crate-wide error type, following the `failure`-based `Error`/`ErrorKind`
//! split used throughout the teacher's `libwallet` crate.

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Display};

/// The four error classes from the error-handling design: transient failures
/// that the caller should simply retry on the next event, protocol
/// violations that abandon a single swap, broadcast failures that should
/// trigger a fee bump, and cryptographic failures that are fatal for the
/// batch in progress.
#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
	/// Network or database hiccup. Never escalates a swap's status; the
	/// caller should just wait for the next event.
	#[fail(display = "transient failure: {}", _0)]
	Transient(String),

	/// The exchange or chain told us something that violates the protocol
	/// (unknown status, vout not found, lockup underpaid). The swap this
	/// pertains to is abandoned, but no prior state is rolled back.
	#[fail(display = "protocol violation: {}", _0)]
	Protocol(String),

	/// Broadcasting a batch failed, e.g. "replacement not economic". The
	/// caller should retry with a higher fee rate.
	#[fail(display = "broadcast failure: {}", _0)]
	Broadcast(String),

	/// Signing or script construction failed. Fatal for the batch in
	/// progress; no partial signature is ever persisted.
	#[fail(display = "cryptographic failure: {}", _0)]
	Cryptographic(String),
}

/// Wraps [`ErrorKind`] with a backtrace, mirroring `grin_wallet_libwallet::Error`.
#[derive(Debug)]
pub struct Error {
	inner: Context<ErrorKind>,
}

impl Fail for Error {
	fn cause(&self) -> Option<&dyn Fail> {
		self.inner.cause()
	}

	fn backtrace(&self) -> Option<&Backtrace> {
		self.inner.backtrace()
	}
}

impl Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		Display::fmt(&self.inner, f)
	}
}

impl Error {
	/// The [`ErrorKind`] this error was constructed from.
	pub fn kind(&self) -> ErrorKind {
		self.inner.get_context().clone()
	}

	/// True for [`ErrorKind::Transient`] failures: the caller should not
	/// escalate the swap's persisted status for these.
	pub fn is_transient(&self) -> bool {
		matches!(self.kind(), ErrorKind::Transient(_))
	}
}

impl From<ErrorKind> for Error {
	fn from(kind: ErrorKind) -> Error {
		Error {
			inner: Context::new(kind),
		}
	}
}

impl From<Context<ErrorKind>> for Error {
	fn from(inner: Context<ErrorKind>) -> Error {
		Error { inner }
	}
}

impl From<bitcoin::sighash::Error> for Error {
	fn from(e: bitcoin::sighash::Error) -> Error {
		ErrorKind::Cryptographic(format!("sighash computation failed: {}", e)).into()
	}
}

impl From<bitcoin::secp256k1::Error> for Error {
	fn from(e: bitcoin::secp256k1::Error) -> Error {
		ErrorKind::Cryptographic(format!("secp256k1 failure: {}", e)).into()
	}
}

impl From<bitcoin::script::PushBytesError> for Error {
	fn from(e: bitcoin::script::PushBytesError) -> Error {
		ErrorKind::Cryptographic(format!("script push failed: {}", e)).into()
	}
}
