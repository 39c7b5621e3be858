//! A [Signer] holding its keys in memory.

use std::collections::HashMap;

use anyhow::Context;
use bitcoin::Transaction;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa, Keypair, Message, PublicKey};
use bitcoin::sighash::SighashCache;

use swap::util::SECP;

use crate::chain::{SignDescriptor, Signer};


/// Signs with in-process keypairs, looked up by public key.
pub struct KeypairSigner {
	keys: HashMap<PublicKey, Keypair>,
}

impl KeypairSigner {
	pub fn new(keys: impl IntoIterator<Item = Keypair>) -> KeypairSigner {
		KeypairSigner {
			keys: keys.into_iter().map(|k| (k.public_key(), k)).collect(),
		}
	}

	fn sign_sync(&self, tx: &Transaction, desc: &SignDescriptor) -> anyhow::Result<ecdsa::Signature> {
		let key = self.keys.get(&desc.key)
			.with_context(|| format!("unknown signing key {}", desc.key))?;
		if desc.input_index >= tx.input.len() {
			bail!("input index {} out of range for tx with {} inputs",
				desc.input_index, tx.input.len(),
			);
		}

		let sighash = SighashCache::new(tx).p2wsh_signature_hash(
			desc.input_index, &desc.witness_script, desc.output.value, desc.sighash_type,
		).context("error computing sighash")?;
		let msg = Message::from_digest(sighash.to_byte_array());
		Ok(SECP.sign_ecdsa(&msg, &key.secret_key()))
	}
}

#[async_trait]
impl Signer for KeypairSigner {
	async fn sign_output_raw(
		&self,
		tx: &Transaction,
		desc: &SignDescriptor,
	) -> anyhow::Result<ecdsa::Signature> {
		self.sign_sync(tx, desc)
	}
}
