//! Spend witnesses for both HTLC paths.

use std::sync::Arc;

use bitcoin::{Script, Witness};
use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::ecdsa;

use bitcoin_ext::TxWeightEstimator;

use crate::htlc::{Htlc, OutputType, PREIMAGE_SIZE};
use crate::lightning::{PaymentHash, Preimage};


/// Worst-case size of a DER signature including the sighash byte.
const MAX_SIG_SIZE: usize = 73;

/// The witness element marking the timeout path.
const TIMEOUT_MARKER: [u8; 1] = [0x00];

/// The preimage doesn't hash to the contract's payment hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("preimage hashes to {got}, expected {expected}")]
pub struct PreimageMismatch {
	pub expected: PaymentHash,
	pub got: PaymentHash,
}

/// Which path a witness spends an HTLC through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HtlcSpendType {
	Success,
	Timeout,
	/// Not an HTLC witness we recognize.
	Unknown,
}

/// Classify a witness spending an HTLC.
pub fn classify(witness: &Witness) -> HtlcSpendType {
	if witness.len() != 3 {
		return HtlcSpendType::Unknown;
	}
	match witness.nth(1) {
		Some(m) if m == &TIMEOUT_MARKER[..] => HtlcSpendType::Timeout,
		Some(p) if p.len() == PREIMAGE_SIZE => HtlcSpendType::Success,
		_ => HtlcSpendType::Unknown,
	}
}

/// Append the SIGHASH_ALL flag to a raw signature.
fn sighash_all_sig(sig: &ecdsa::Signature) -> Vec<u8> {
	bitcoin::ecdsa::Signature::sighash_all(*sig).to_vec()
}

impl Htlc {
	/// Create the witness claiming the HTLC with the preimage.
	pub fn success_witness(
		&self,
		sig: &ecdsa::Signature,
		preimage: Preimage,
	) -> Result<Witness, PreimageMismatch> {
		let got = preimage.compute_payment_hash();
		if got != self.payment_hash {
			return Err(PreimageMismatch { expected: self.payment_hash, got });
		}

		let mut ret = Witness::new();
		ret.push(sighash_all_sig(sig));
		ret.push(preimage.as_ref());
		ret.push(self.script.as_bytes());
		Ok(ret)
	}

	/// Create the witness reclaiming the HTLC after expiry.
	pub fn timeout_witness(&self, sig: &ecdsa::Signature) -> Witness {
		let mut ret = Witness::new();
		ret.push(sighash_all_sig(sig));
		ret.push(TIMEOUT_MARKER);
		ret.push(self.script.as_bytes());
		ret
	}

	/// Upper bound of the serialized success witness size.
	pub fn max_success_witness_size(&self) -> usize {
		1 + 1 + MAX_SIG_SIZE + 1 + 33 + 1 + self.script.len()
	}

	/// Upper bound of the serialized timeout witness size.
	pub fn max_timeout_witness_size(&self) -> usize {
		1 + 1 + MAX_SIG_SIZE + 1 + 1 + 1 + self.script.len()
	}

	fn add_input_to_estimator(&self, est: &mut TxWeightEstimator, witness_size: usize) {
		match self.output_type {
			OutputType::P2wsh => est.add_witness_input(witness_size),
			OutputType::NestedP2wsh => est.add_nested_p2wsh_input(witness_size),
		};
	}

	/// Add a success-path input spending this HTLC to the estimator.
	pub fn add_success_to_estimator(&self, est: &mut TxWeightEstimator) {
		self.add_input_to_estimator(est, self.max_success_witness_size());
	}

	/// Add a timeout-path input spending this HTLC to the estimator.
	pub fn add_timeout_to_estimator(&self, est: &mut TxWeightEstimator) {
		self.add_input_to_estimator(est, self.max_timeout_witness_size());
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SweepPath {
	Success(Preimage),
	Timeout,
}

/// A contract together with the path we intend to spend it through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepWitness {
	htlc: Arc<Htlc>,
	path: SweepPath,
}

impl SweepWitness {
	/// Spend through the success path.
	///
	/// Fails if the preimage doesn't match the contract.
	pub fn success(htlc: Arc<Htlc>, preimage: Preimage) -> Result<SweepWitness, PreimageMismatch> {
		let got = preimage.compute_payment_hash();
		if got != htlc.payment_hash {
			return Err(PreimageMismatch { expected: htlc.payment_hash, got });
		}
		Ok(SweepWitness { htlc, path: SweepPath::Success(preimage) })
	}

	/// Spend through the timeout path.
	pub fn timeout(htlc: Arc<Htlc>) -> SweepWitness {
		SweepWitness { htlc, path: SweepPath::Timeout }
	}

	pub fn htlc(&self) -> &Arc<Htlc> {
		&self.htlc
	}

	pub fn spend_type(&self) -> HtlcSpendType {
		match self.path {
			SweepPath::Success(_) => HtlcSpendType::Success,
			SweepPath::Timeout => HtlcSpendType::Timeout,
		}
	}

	/// The locktime the spending transaction needs.
	pub fn lock_time(&self) -> LockTime {
		match self.path {
			SweepPath::Success(_) => LockTime::ZERO,
			SweepPath::Timeout => self.htlc.locktime(),
		}
	}

	pub fn witness_script(&self) -> &Script {
		&self.htlc.script
	}

	/// The scriptSig the spending input must carry.
	pub fn sig_script(&self) -> &Script {
		&self.htlc.sig_script
	}

	/// Upper bound of the witness size, and whether the input is nested.
	pub fn size_upper_bound(&self) -> (usize, bool) {
		let size = match self.path {
			SweepPath::Success(_) => self.htlc.max_success_witness_size(),
			SweepPath::Timeout => self.htlc.max_timeout_witness_size(),
		};
		(size, self.htlc.output_type == OutputType::NestedP2wsh)
	}

	/// Add this input to the weight estimator.
	pub fn add_weight_estimation(&self, est: &mut TxWeightEstimator) {
		match self.path {
			SweepPath::Success(_) => self.htlc.add_success_to_estimator(est),
			SweepPath::Timeout => self.htlc.add_timeout_to_estimator(est),
		}
	}

	/// Build the final witness from the raw signature.
	pub fn witness(&self, sig: &ecdsa::Signature) -> Witness {
		match self.path {
			SweepPath::Success(preimage) => self.htlc.success_witness(sig, preimage)
				.expect("preimage checked on construction"),
			SweepPath::Timeout => self.htlc.timeout_witness(sig),
		}
	}
}
