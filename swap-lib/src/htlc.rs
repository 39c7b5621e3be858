//! Construction of the HTLC contract output.

use std::fmt;

use bitcoin::{opcodes, Address, Network, Script, ScriptBuf};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::script::{Builder, PushBytes};
use bitcoin::secp256k1::{PublicKey, SecretKey};

use crate::lightning::PaymentHash;
use crate::util::SECP;


/// The size of the preimage that unlocks the success path.
pub const PREIMAGE_SIZE: usize = 32;

/// Encoding of the on-chain output locking an HTLC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputType {
	/// Native pay-to-witness-script-hash.
	P2wsh,
	/// P2WSH wrapped in a legacy pay-to-script-hash output.
	NestedP2wsh,
}

impl OutputType {
	pub fn as_u8(self) -> u8 {
		match self {
			OutputType::P2wsh => 0,
			OutputType::NestedP2wsh => 1,
		}
	}
}

impl fmt::Display for OutputType {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			OutputType::P2wsh => f.write_str("p2wsh"),
			OutputType::NestedP2wsh => f.write_str("nested-p2wsh"),
		}
	}
}

/// An output type tag that we can't handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unsupported htlc output encoding: {0}")]
pub struct UnsupportedEncoding(pub u8);

impl TryFrom<u8> for OutputType {
	type Error = UnsupportedEncoding;

	fn try_from(v: u8) -> Result<Self, Self::Error> {
		match v {
			0 => Ok(OutputType::P2wsh),
			1 => Ok(OutputType::NestedP2wsh),
			v => Err(UnsupportedEncoding(v)),
		}
	}
}

/// Build the HTLC witness script.
///
/// The receiver can claim with the preimage of `payment_hash`, the sender
/// can reclaim after `cltv_expiry`.
pub fn htlc_script(
	cltv_expiry: i32,
	sender: PublicKey,
	receiver: PublicKey,
	payment_hash: PaymentHash,
) -> ScriptBuf {
	Builder::new()
		.push_opcode(opcodes::all::OP_SIZE)
		.push_int(PREIMAGE_SIZE as i64)
		.push_opcode(opcodes::all::OP_EQUAL)
		.push_opcode(opcodes::all::OP_IF)
			.push_opcode(opcodes::all::OP_HASH160)
			.push_slice(payment_hash.ripemd160().as_byte_array())
			.push_opcode(opcodes::all::OP_EQUALVERIFY)
			.push_key(&bitcoin::PublicKey::new(receiver))
		.push_opcode(opcodes::all::OP_ELSE)
			.push_opcode(opcodes::all::OP_DROP)
			.push_int(cltv_expiry as i64)
			.push_opcode(opcodes::all::OP_CLTV)
			.push_opcode(opcodes::all::OP_DROP)
			.push_key(&bitcoin::PublicKey::new(sender))
		.push_opcode(opcodes::all::OP_ENDIF)
		.push_opcode(opcodes::all::OP_CHECKSIG)
		.into_script()
}

/// The spendable output of a contract script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcOutput {
	pub script_pubkey: ScriptBuf,
	pub address: Address,
	/// The scriptSig every spending input must carry.
	///
	/// Empty for native outputs.
	pub sig_script: ScriptBuf,
}

/// Derive the output locking the given witness script.
pub fn derive_output(script: &Script, output_type: OutputType, network: Network) -> HtlcOutput {
	let p2wsh = ScriptBuf::new_p2wsh(&script.wscript_hash());
	match output_type {
		OutputType::P2wsh => HtlcOutput {
			address: Address::p2wsh(script, network),
			script_pubkey: p2wsh,
			sig_script: ScriptBuf::new(),
		},
		OutputType::NestedP2wsh => {
			let program = <&PushBytes>::try_from(p2wsh.as_bytes())
				.expect("witness program fits in a push");
			HtlcOutput {
				address: Address::p2shwsh(script, network),
				script_pubkey: ScriptBuf::new_p2sh(&p2wsh.script_hash()),
				sig_script: Builder::new().push_slice(program).into_script(),
			}
		},
	}
}

/// A hash-time-locked contract output.
///
/// All fields are fixed once the contract is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Htlc {
	pub cltv_expiry: i32,
	pub sender: PublicKey,
	pub receiver: PublicKey,
	pub payment_hash: PaymentHash,
	pub output_type: OutputType,
	pub network: Network,
	pub script: ScriptBuf,
	pub script_pubkey: ScriptBuf,
	pub address: Address,
	pub sig_script: ScriptBuf,
}

impl Htlc {
	pub fn new(
		cltv_expiry: i32,
		sender: PublicKey,
		receiver: PublicKey,
		payment_hash: PaymentHash,
		output_type: OutputType,
		network: Network,
	) -> Htlc {
		let script = htlc_script(cltv_expiry, sender, receiver, payment_hash);
		let HtlcOutput { script_pubkey, address, sig_script } =
			derive_output(&script, output_type, network);
		Htlc {
			cltv_expiry, sender, receiver, payment_hash, output_type, network,
			script, script_pubkey, address, sig_script,
		}
	}

	/// The locktime a transaction needs to spend the timeout path.
	pub fn locktime(&self) -> LockTime {
		LockTime::from_consensus(self.cltv_expiry as u32)
	}
}

lazy_static! {
	/// A template contract for fee quoting.
	///
	/// Uses the largest possible expiry so that the script has its
	/// maximum size.
	pub static ref QUOTE_HTLC: Htlc = {
		let key = SecretKey::from_slice(&[1; 32]).expect("valid secret key");
		let pubkey = PublicKey::from_secret_key(&SECP, &key);
		Htlc::new(
			i32::MAX, pubkey, pubkey, PaymentHash::from([0; 32]),
			OutputType::P2wsh, Network::Bitcoin,
		)
	};
}

#[cfg(test)]
pub(crate) mod test {
	use super::*;

	use bitcoin::hex::DisplayHex;
	use bitcoin::script::Instruction;

	use crate::lightning::Preimage;

	pub fn sender_key() -> SecretKey {
		SecretKey::from_slice(&[0x11; 32]).unwrap()
	}

	pub fn receiver_key() -> SecretKey {
		SecretKey::from_slice(&[0x22; 32]).unwrap()
	}

	pub fn preimage() -> Preimage {
		Preimage::from([0x33; 32])
	}

	pub fn htlc(output_type: OutputType) -> Htlc {
		Htlc::new(
			800_000,
			sender_key().public_key(&SECP),
			receiver_key().public_key(&SECP),
			preimage().compute_payment_hash(),
			output_type,
			Network::Regtest,
		)
	}

	#[test]
	fn script_layout() {
		let h = htlc(OutputType::P2wsh);
		let ops = h.script.instructions().map(|i| i.unwrap()).collect::<Vec<_>>();
		assert_eq!(ops.len(), 16);
		assert_eq!(ops[0], Instruction::Op(opcodes::all::OP_SIZE));
		assert_eq!(ops[1].push_bytes().unwrap().as_bytes(), &[32]);
		assert_eq!(ops[4], Instruction::Op(opcodes::all::OP_HASH160));
		assert_eq!(
			ops[5].push_bytes().unwrap().as_bytes(),
			h.payment_hash.ripemd160().as_byte_array(),
		);
		assert_eq!(ops[7].push_bytes().unwrap().as_bytes(), &h.receiver.serialize());
		assert_eq!(ops[8], Instruction::Op(opcodes::all::OP_ELSE));
		// 800000 as a little-endian script number
		assert_eq!(ops[10].push_bytes().unwrap().as_bytes(), &[0x00, 0x35, 0x0c]);
		assert_eq!(ops[11], Instruction::Op(opcodes::all::OP_CLTV));
		assert_eq!(ops[13].push_bytes().unwrap().as_bytes(), &h.sender.serialize());
		assert_eq!(ops[14], Instruction::Op(opcodes::all::OP_ENDIF));
		assert_eq!(ops[15], Instruction::Op(opcodes::all::OP_CHECKSIG));

		// both parties must derive the same script
		let again = htlc_script(800_000, h.sender, h.receiver, h.payment_hash);
		assert_eq!(h.script, again);
		assert_eq!(h.script.len(), 1 + 2 + 1 + 1 + 1 + 21 + 1 + 34 + 1 + 1 + 4 + 1 + 1 + 34 + 1 + 1);
	}

	#[test]
	fn script_small_expiry() {
		let h = htlc(OutputType::P2wsh);
		let s = htlc_script(10, h.sender, h.receiver, h.payment_hash);
		let ops = s.instructions().map(|i| i.unwrap()).collect::<Vec<_>>();
		assert_eq!(ops[10], Instruction::Op(opcodes::all::OP_PUSHNUM_10));
	}

	#[test]
	fn native_output() {
		let h = htlc(OutputType::P2wsh);
		assert_eq!(h.script_pubkey.len(), 34);
		assert_eq!(&h.script_pubkey.as_bytes()[..2], &[0x00, 0x20]);
		assert!(h.script_pubkey.is_p2wsh());
		assert!(h.sig_script.is_empty());

		let again = derive_output(&h.script, OutputType::P2wsh, Network::Regtest);
		assert_eq!(again.script_pubkey, h.script_pubkey);
		assert_eq!(Address::from_script(&h.script_pubkey, Network::Regtest).unwrap(), h.address);
		assert_eq!(h.address.script_pubkey(), h.script_pubkey);
	}

	#[test]
	fn nested_output() {
		let h = htlc(OutputType::NestedP2wsh);
		let native = htlc(OutputType::P2wsh);
		assert_eq!(h.script, native.script);

		assert_eq!(h.script_pubkey.len(), 23);
		assert!(h.script_pubkey.is_p2sh());
		assert_eq!(h.sig_script.len(), 35);
		let push = h.sig_script.instructions().map(|i| i.unwrap()).collect::<Vec<_>>();
		assert_eq!(push.len(), 1);
		assert_eq!(push[0].push_bytes().unwrap().as_bytes(), native.script_pubkey.as_bytes());

		assert_eq!(Address::from_script(&h.script_pubkey, Network::Regtest).unwrap(), h.address);
		assert_eq!(h.address.script_pubkey(), h.script_pubkey);
	}

	#[test]
	fn output_type_tags() {
		for t in [OutputType::P2wsh, OutputType::NestedP2wsh] {
			assert_eq!(OutputType::try_from(t.as_u8()), Ok(t));
		}
		assert_eq!(OutputType::try_from(2), Err(UnsupportedEncoding(2)));
		assert_eq!(OutputType::try_from(0xff).unwrap_err().to_string(),
			"unsupported htlc output encoding: 255",
		);
	}

	#[test]
	fn quote_htlc_is_largest() {
		let h = htlc(OutputType::P2wsh);
		assert_eq!(QUOTE_HTLC.script.len(), h.script.len() + 1);
		assert_eq!(QUOTE_HTLC.script.as_bytes()[64..69].as_hex().to_string(), "04ffffff7f");
	}
}
