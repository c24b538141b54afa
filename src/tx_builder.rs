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

//! Component A: the pure transaction builder (§4.1). Given spendable inputs
//! and outputs, produces a signed, RBF-enabled transaction and its vsize.
//! Used synchronously by the batcher (Component B); never writes anywhere
//! itself.

use crate::error::{Error, ErrorKind};
use bitcoin::absolute::LockTime;
use bitcoin::ecdsa::Signature as EcdsaSignature;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
	Address, Amount, Network, OutPoint, PrivateKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
	Witness,
};
use serde::{Deserialize, Serialize};

/// How the lockup output being spent was constructed. Determines which
/// signing path §4.1 prescribes. Negotiated per swap at creation time and
/// persisted alongside it, since a P2SH address alone cannot distinguish
/// `Legacy` from `NestedSegWit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputType {
	Legacy,
	NestedSegWit,
	NativeSegWit,
}

impl OutputType {
	/// Derives the lockup address for `redeem_script` under this output
	/// type (§4.1: P2SH, P2SH-P2WSH, or native P2WSH).
	pub fn lockup_address(self, redeem_script: &ScriptBuf, network: Network) -> Address {
		match self {
			OutputType::Legacy => Address::p2sh(redeem_script, network)
				.expect("redeem script within P2SH push-data limit"),
			OutputType::NestedSegWit => Address::p2shwsh(redeem_script, network),
			OutputType::NativeSegWit => Address::p2wsh(redeem_script, network),
		}
	}
}

/// One spendable input: either a claim (preimage present, timeout zero) or a
/// refund (preimage absent/empty, timeout set) of a lockup output.
#[derive(Debug, Clone)]
pub struct InputDetail {
	pub lockup_transaction: Transaction,
	pub vout: u32,
	pub output_type: OutputType,
	pub redeem_script: Vec<u8>,
	pub private_key: PrivateKey,
	/// Empty on the refund path; the on-chain script still expects a
	/// (possibly zero-length) stack element, so this is never omitted.
	pub preimage: Vec<u8>,
	/// Zero on the claim path.
	pub timeout_block_height: u32,
}

impl InputDetail {
	fn value(&self) -> Amount {
		self.lockup_transaction.output[self.vout as usize].value
	}

	/// The input's value in satoshis, used by the batcher to size the
	/// sweep output (§4.1).
	pub fn value_sat(&self) -> u64 {
		self.value().to_sat()
	}
}

/// One transaction output.
#[derive(Debug, Clone)]
pub struct OutputDetail {
	pub script_pubkey: ScriptBuf,
	pub value: Amount,
}

fn push_bytes(data: &[u8]) -> Result<PushBytesBuf, Error> {
	PushBytesBuf::try_from(data.to_vec())
		.map_err(|_| ErrorKind::Cryptographic("push data exceeds script limit".to_string()).into())
}

/// `OP_0 <sha256(witness_script)>`, the P2WSH program wrapped for a
/// P2SH-nested SegWit input (the "Compatibility" output type upstream).
fn nested_witness_program(witness_script: &ScriptBuf) -> ScriptBuf {
	ScriptBuf::new_p2wsh(&witness_script.wscript_hash())
}

/// `vsize = stripped_size + ceil(witness_overhead / 4)` (§4.1, §8). Computed
/// by comparing the full serialization against a copy with every witness
/// cleared, which is exactly BIP-144's `stripped_size`.
pub fn vsize(tx: &Transaction) -> u64 {
	let total = bitcoin::consensus::encode::serialize(tx).len();
	let mut stripped_tx = tx.clone();
	for input in stripped_tx.input.iter_mut() {
		input.witness = Witness::default();
	}
	let stripped = bitcoin::consensus::encode::serialize(&stripped_tx).len();
	let witness_overhead = total.saturating_sub(stripped);
	(stripped + (witness_overhead + 3) / 4) as u64
}

/// Builds and signs a transaction spending `inputs` to `outputs` (§4.1).
/// Returns the signed transaction together with its vsize. Any signing or
/// script-construction failure aborts with no partial signing performed.
pub fn build(
	inputs: &[InputDetail],
	outputs: &[OutputDetail],
) -> Result<(Transaction, u64), Error> {
	let lock_time = inputs
		.iter()
		.map(|input| input.timeout_block_height)
		.max()
		.unwrap_or(0);

	let tx_in: Vec<TxIn> = inputs
		.iter()
		.map(|input| TxIn {
			previous_output: OutPoint {
				txid: input.lockup_transaction.txid(),
				vout: input.vout,
			},
			script_sig: ScriptBuf::new(),
			// Every input opts into replace-by-fee (§4.1).
			sequence: Sequence(0),
			witness: Witness::default(),
		})
		.collect();

	let tx_out: Vec<TxOut> = outputs
		.iter()
		.map(|output| TxOut {
			value: output.value,
			script_pubkey: output.script_pubkey.clone(),
		})
		.collect();

	let mut transaction = Transaction {
		version: bitcoin::transaction::Version::ONE,
		lock_time: LockTime::from_height(lock_time)
			.map_err(|e| ErrorKind::Cryptographic(format!("invalid locktime: {}", e)))?,
		input: tx_in,
		output: tx_out,
	};

	let secp = Secp256k1::new();

	for index in 0..inputs.len() {
		let input = &inputs[index];
		let redeem_script = ScriptBuf::from_bytes(input.redeem_script.clone());

		match input.output_type {
			OutputType::Legacy => {
				let mut cache = SighashCache::new(&transaction);
				let sighash =
					cache.legacy_signature_hash(index, &redeem_script, EcdsaSighashType::All.to_u32())?;
				let message = Message::from_digest_slice(sighash.as_ref())?;
				let signature = EcdsaSignature {
					sig: secp.sign_ecdsa(&message, &input.private_key.inner),
					hash_ty: EcdsaSighashType::All,
				};

				let script_sig = Builder::new()
					.push_slice(push_bytes(&signature.to_vec())?)
					.push_slice(push_bytes(&input.preimage)?)
					.push_slice(push_bytes(&input.redeem_script)?)
					.into_script();

				transaction.input[index].script_sig = script_sig;
			}
			OutputType::NestedSegWit => {
				let program = nested_witness_program(&redeem_script);
				let script_sig = Builder::new()
					.push_slice(push_bytes(program.as_bytes())?)
					.into_script();
				transaction.input[index].script_sig = script_sig;
			}
			OutputType::NativeSegWit => {
				// Empty script_sig, already set above.
			}
		}

		if input.output_type != OutputType::Legacy {
			let mut cache = SighashCache::new(&transaction);
			let sighash = cache.p2wsh_signature_hash(
				index,
				&redeem_script,
				input.value(),
				EcdsaSighashType::All,
			)?;
			let message = Message::from_digest_slice(sighash.as_ref())?;
			let signature = EcdsaSignature {
				sig: secp.sign_ecdsa(&message, &input.private_key.inner),
				hash_ty: EcdsaSighashType::All,
			};

			transaction.input[index].witness = Witness::from_slice(&[
				signature.to_vec(),
				input.preimage.clone(),
				input.redeem_script.clone(),
			]);
		}
	}

	let size = vsize(&transaction);
	Ok((transaction, size))
}
