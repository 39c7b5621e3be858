//! Interfaces of the external services the sweeper relies on.

use bitcoin::{Address, BlockHash, FeeRate, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use bitcoin::secp256k1::{ecdsa, PublicKey};
use bitcoin::sighash::EcdsaSighashType;
use futures::stream::BoxStream;

use bitcoin_ext::BlockHeight;


/// A long-lived stream of chain events.
///
/// Dropping the stream cancels the registration.
pub type EventStream<T> = BoxStream<'static, anyhow::Result<T>>;

/// Everything a signer needs to produce a segwit v0 signature for one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignDescriptor {
	/// The key to sign with.
	pub key: PublicKey,
	/// The script the previous output commits to.
	pub witness_script: ScriptBuf,
	/// The previous output being spent.
	pub output: TxOut,
	pub input_index: usize,
	pub sighash_type: EcdsaSighashType,
}

/// A service that signs transaction inputs.
///
/// Must be safe to call concurrently for independent inputs.
#[async_trait]
pub trait Signer: Send + Sync + 'static {
	/// Produce a raw signature, without the sighash flag, for the input
	/// described by `desc`.
	async fn sign_output_raw(
		&self,
		tx: &Transaction,
		desc: &SignDescriptor,
	) -> anyhow::Result<ecdsa::Signature>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendEvent {
	pub outpoint: OutPoint,
	pub spending_tx: Transaction,
	pub spending_height: BlockHeight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfEvent {
	pub txid: Txid,
	pub block_height: BlockHeight,
	pub tx: Transaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEpoch {
	pub height: BlockHeight,
	pub hash: BlockHash,
}

/// A service notifying about chain events.
#[async_trait]
pub trait ChainNotifier: Send + Sync + 'static {
	/// Watch for a transaction spending `outpoint`.
	///
	/// The stream yields an event once the spend is in a block. Events
	/// might be repeated after a reorg.
	async fn register_spend(
		&self,
		outpoint: OutPoint,
		pk_script: ScriptBuf,
		height_hint: BlockHeight,
	) -> anyhow::Result<EventStream<SpendEvent>>;

	/// Watch for `txid` to reach `num_confs` confirmations.
	async fn register_confirmation(
		&self,
		txid: Txid,
		pk_script: ScriptBuf,
		num_confs: u32,
		height_hint: BlockHeight,
	) -> anyhow::Result<EventStream<ConfEvent>>;

	/// Receive every new block tip, starting with the current one.
	async fn register_block_epoch(&self) -> anyhow::Result<EventStream<BlockEpoch>>;
}

/// The on-chain wallet backing the sweeper.
#[async_trait]
pub trait WalletOracle: Send + Sync + 'static {
	async fn estimate_fee_rate(&self, conf_target: u16) -> anyhow::Result<FeeRate>;

	/// A fresh address of the wallet to sweep into.
	async fn next_address(&self) -> anyhow::Result<Address>;

	/// Publish the transaction.
	///
	/// Publishing a transaction that is already known is not an error.
	async fn publish_transaction(&self, tx: &Transaction) -> anyhow::Result<()>;
}
