//! Building and signing sweep transactions.

use std::time::Duration;

use anyhow::Context;
use bitcoin::{
	Address, Amount, FeeRate, OutPoint, Sequence, Transaction, TxIn, TxOut, Weight, Witness,
};
use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::PublicKey;
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::transaction::Version;
use futures::future;

use swap::SweepWitness;
use swap::fee::{fee_for_weight, sweep_tx_weight, UnsupportedAddressType};

use crate::chain::{SignDescriptor, Signer};
use crate::error::SweepError;


/// An HTLC output to sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepInput {
	pub outpoint: OutPoint,
	pub witness: SweepWitness,
	pub amount: Amount,
	/// The key the signer signs this input with.
	pub key: PublicKey,
}

impl SweepInput {
	/// The output this input spends.
	pub fn prevout(&self) -> TxOut {
		TxOut {
			value: self.amount,
			script_pubkey: self.witness.htlc().script_pubkey.clone(),
		}
	}

	fn unsigned_txin(&self) -> TxIn {
		TxIn {
			previous_output: self.outpoint,
			// nested inputs need their scriptSig before they're signed
			script_sig: self.witness.sig_script().to_owned(),
			sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
			witness: Witness::new(),
		}
	}

	fn sign_descriptor(&self, input_index: usize) -> SignDescriptor {
		SignDescriptor {
			key: self.key,
			witness_script: self.witness.witness_script().to_owned(),
			output: self.prevout(),
			input_index,
			sighash_type: EcdsaSighashType::All,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SweepTxError {
	#[error("{0}")]
	UnsupportedDestination(#[from] UnsupportedAddressType),
	#[error("sweep is uneconomical: fee {fee} exceeds what {total} of inputs can pay")]
	Uneconomical {
		total: Amount,
		fee: Amount,
	},
	#[error("inputs have incompatible locktimes")]
	IncompatibleLockTimes,
	#[error("no inputs to sweep")]
	NoInputs,
	#[error("error signing input {outpoint}: {err}")]
	Signer {
		outpoint: OutPoint,
		err: String,
	},
}

impl From<SweepTxError> for SweepError {
	fn from(e: SweepTxError) -> SweepError {
		match e {
			SweepTxError::Signer { .. } => SweepError::signer(e),
			e => SweepError::broadcast(e),
		}
	}
}

/// The locktime a transaction spending all inputs needs.
///
/// Returns [None] if the inputs mix block heights and timestamps.
pub fn sweep_lock_time(inputs: &[SweepInput]) -> Option<LockTime> {
	inputs.iter().try_fold(LockTime::ZERO, |acc, i| {
		bitcoin_ext::max_locktime(acc, i.witness.lock_time())
	})
}

/// The weight a sweep tx of these inputs to `dest` has at most.
pub fn sweep_weight(inputs: &[SweepInput], dest: &Address) -> Result<Weight, UnsupportedAddressType> {
	sweep_tx_weight(dest, |est| {
		for input in inputs {
			input.witness.add_weight_estimation(est);
		}
	})
}

/// A sweep transaction with all its inputs signed.
#[derive(Debug, Clone)]
pub struct SignedSweep {
	pub tx: Transaction,
	pub fee: Amount,
}

/// Create the unsigned sweep tx and the fee it pays.
pub fn unsigned_sweep_tx(
	inputs: &[SweepInput],
	fee_rate: FeeRate,
	dest: &Address,
) -> Result<(Transaction, Amount), SweepTxError> {
	if inputs.is_empty() {
		return Err(SweepTxError::NoInputs);
	}
	let lock_time = sweep_lock_time(inputs).ok_or(SweepTxError::IncompatibleLockTimes)?;

	let weight = sweep_weight(inputs, dest)?;
	let fee = fee_for_weight(fee_rate, weight);
	let total = inputs.iter().map(|i| i.amount).sum::<Amount>();

	let script_pubkey = dest.script_pubkey();
	let value = match total.checked_sub(fee) {
		Some(v) if v >= script_pubkey.minimal_non_dust() => v,
		_ => return Err(SweepTxError::Uneconomical { total, fee }),
	};

	let tx = Transaction {
		version: Version::TWO,
		lock_time,
		input: inputs.iter().map(|i| i.unsigned_txin()).collect(),
		output: vec![TxOut { value, script_pubkey }],
	};
	Ok((tx, fee))
}

/// Sign all inputs of the tx concurrently and set their witnesses.
///
/// Fails as a whole if any of the signatures fails.
pub async fn sign_sweep_tx(
	signer: &dyn Signer,
	mut tx: Transaction,
	inputs: &[SweepInput],
	call_timeout: Duration,
) -> Result<Transaction, SweepTxError> {
	let descs = inputs.iter().enumerate().map(|(i, input)| input.sign_descriptor(i))
		.collect::<Vec<_>>();
	let sigs = {
		let tx = &tx;
		future::join_all(descs.iter().map(|desc| async move {
			tokio::time::timeout(call_timeout, signer.sign_output_raw(tx, desc)).await
				.context("signer timed out")
				.and_then(|r| r)
		})).await
	};

	for ((input, txin), sig) in inputs.iter().zip(tx.input.iter_mut()).zip(sigs) {
		let sig = sig.map_err(|e| SweepTxError::Signer {
			outpoint: input.outpoint,
			err: format!("{:#}", e),
		})?;
		txin.witness = input.witness.witness(&sig);
	}
	Ok(tx)
}

/// Build and sign a sweep of `inputs` into `dest`.
pub async fn build_sweep_tx(
	signer: &dyn Signer,
	inputs: &[SweepInput],
	fee_rate: FeeRate,
	dest: &Address,
	call_timeout: Duration,
) -> Result<SignedSweep, SweepTxError> {
	let (tx, fee) = unsigned_sweep_tx(inputs, fee_rate, dest)?;
	let tx = sign_sweep_tx(signer, tx, inputs, call_timeout).await?;
	Ok(SignedSweep { tx, fee })
}

/// Sign a sweep of `inputs` into `dest` without publishing it.
pub async fn create_sweep_tx(
	signer: &dyn Signer,
	inputs: &[SweepInput],
	fee_rate: FeeRate,
	dest: &Address,
	call_timeout: Duration,
) -> Result<Transaction, SweepError> {
	Ok(build_sweep_tx(signer, inputs, fee_rate, dest, call_timeout).await?.tx)
}
