//! Transaction weight estimation for fee planning.

use cbitcoin::Weight;
use cbitcoin::consensus::encode::VarInt;

use crate::WITNESS_SCALE_FACTOR;


/// Size of the version and locktime fields.
pub const BASE_TX_SIZE: usize = 4 + 4;

/// Size of the segwit marker and flag bytes.
pub const WITNESS_HEADER_SIZE: usize = 1 + 1;

/// Size of a tx input without scriptSig data:
/// outpoint (36), scriptSig length (1), sequence (4).
pub const INPUT_SIZE: usize = 32 + 4 + 1 + 4;

/// Size of a P2WSH witness program script: OP_0 OP_PUSHBYTES_32 <32 bytes>.
pub const P2WSH_SIZE: usize = 1 + 1 + 32;

/// Size of the scriptSig of a nested P2WSH input: a single push of the
/// witness program.
pub const NESTED_P2WSH_SIZE: usize = 1 + P2WSH_SIZE;

/// Size of a P2WPKH witness program script: OP_0 OP_PUSHBYTES_20 <20 bytes>.
pub const P2WPKH_SIZE: usize = 1 + 1 + 20;

/// Size of a P2SH script: OP_HASH160 OP_PUSHBYTES_20 <20 bytes> OP_EQUAL.
pub const P2SH_SIZE: usize = 1 + 1 + 20 + 1;

/// Size of a P2PKH script:
/// OP_DUP OP_HASH160 OP_PUSHBYTES_20 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG.
pub const P2PKH_SIZE: usize = 1 + 1 + 1 + 20 + 1 + 1;

/// Size of a tx output: value (8), script length (1), script.
pub const P2WSH_OUTPUT_SIZE: usize = 8 + 1 + P2WSH_SIZE;
pub const P2WPKH_OUTPUT_SIZE: usize = 8 + 1 + P2WPKH_SIZE;
pub const P2SH_OUTPUT_SIZE: usize = 8 + 1 + P2SH_SIZE;
pub const P2PKH_OUTPUT_SIZE: usize = 8 + 1 + P2PKH_SIZE;

/// Accumulates the size of inputs and outputs of a transaction that is yet
/// to be built so that its final weight can be predicted.
///
/// Witness sizes passed in must include the witness element count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxWeightEstimator {
	has_witness: bool,
	input_count: usize,
	output_count: usize,
	input_size: usize,
	input_witness_size: usize,
	output_size: usize,
}

impl TxWeightEstimator {
	pub fn new() -> TxWeightEstimator {
		TxWeightEstimator::default()
	}

	/// Add a segwit input with the given witness size.
	pub fn add_witness_input(&mut self, witness_size: usize) -> &mut Self {
		self.input_size += INPUT_SIZE;
		self.input_witness_size += witness_size;
		self.input_count += 1;
		self.has_witness = true;
		self
	}

	/// Add a P2SH-wrapped P2WSH input with the given witness size.
	pub fn add_nested_p2wsh_input(&mut self, witness_size: usize) -> &mut Self {
		self.input_size += INPUT_SIZE + NESTED_P2WSH_SIZE;
		self.input_witness_size += witness_size;
		self.input_count += 1;
		self.has_witness = true;
		self
	}

	pub fn add_p2wsh_output(&mut self) -> &mut Self {
		self.add_output(P2WSH_OUTPUT_SIZE)
	}

	pub fn add_p2wkh_output(&mut self) -> &mut Self {
		self.add_output(P2WPKH_OUTPUT_SIZE)
	}

	pub fn add_p2sh_output(&mut self) -> &mut Self {
		self.add_output(P2SH_OUTPUT_SIZE)
	}

	pub fn add_p2pkh_output(&mut self) -> &mut Self {
		self.add_output(P2PKH_OUTPUT_SIZE)
	}

	fn add_output(&mut self, size: usize) -> &mut Self {
		self.output_size += size;
		self.output_count += 1;
		self
	}

	/// The predicted weight of the transaction.
	pub fn weight(&self) -> Weight {
		let stripped = BASE_TX_SIZE
			+ VarInt(self.input_count as u64).size() + self.input_size
			+ VarInt(self.output_count as u64).size() + self.output_size;
		let mut wu = stripped * WITNESS_SCALE_FACTOR;
		if self.has_witness {
			wu += WITNESS_HEADER_SIZE + self.input_witness_size;
		}
		Weight::from_wu(wu as u64)
	}
}
