//! Deterministic fakes of the external services.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{
	Address, Amount, BlockHash, CompressedPublicKey, FeeRate, Network, OutPoint, ScriptBuf,
	Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa, Keypair, PublicKey, SecretKey};
use bitcoin::transaction::Version;
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use tokio::sync::mpsc;

use swap::{Htlc, OutputType, PaymentHash, SweepWitness};
use swap::util::SECP;

use crate::batch::SweepInput;
use crate::chain::{
	BlockEpoch, ChainNotifier, ConfEvent, EventStream, SignDescriptor, Signer, SpendEvent,
	WalletOracle,
};
use crate::config::Config;
use crate::fees::FeePreference;
use crate::signer::KeypairSigner;
use crate::sweeper::SweepRequest;


pub const SENDER_KEY: [u8; 32] = [0x11; 32];
pub const RECEIVER_KEY: [u8; 32] = [0x22; 32];
const WALLET_KEY: [u8; 32] = [0x44; 32];
const FUNDING_TXID: [u8; 32] = [0xaa; 32];

fn pubkey(sk: &[u8; 32]) -> PublicKey {
	SecretKey::from_slice(sk).unwrap().public_key(&SECP)
}

pub fn test_keypairs() -> Vec<Keypair> {
	[SENDER_KEY, RECEIVER_KEY].iter()
		.map(|sk| Keypair::from_seckey_slice(&SECP, sk).unwrap())
		.collect()
}

pub fn test_config() -> Config {
	let mut cfg = Config::default();
	cfg.batch_window = Duration::from_secs(1);
	cfg.max_sweep_attempts = 5;
	cfg
}

pub fn test_htlc_typed(cltv_expiry: i32, output_type: OutputType) -> Htlc {
	Htlc::new(
		cltv_expiry,
		pubkey(&SENDER_KEY),
		pubkey(&RECEIVER_KEY),
		PaymentHash::from([0x33; 32]),
		output_type,
		Network::Regtest,
	)
}

pub fn test_htlc(cltv_expiry: i32) -> Htlc {
	test_htlc_typed(cltv_expiry, OutputType::P2wsh)
}

/// A timeout sweep of output `vout` of the funding tx.
pub fn timeout_input(vout: u32, cltv_expiry: i32, sats: u64) -> SweepInput {
	SweepInput {
		outpoint: OutPoint::new(Txid::from_byte_array(FUNDING_TXID), vout),
		witness: SweepWitness::timeout(Arc::new(test_htlc(cltv_expiry))),
		amount: Amount::from_sat(sats),
		key: pubkey(&SENDER_KEY),
	}
}

pub fn request(vout: u32, cltv_expiry: i32, sats: u64, fee_preference: FeePreference) -> SweepRequest {
	let input = timeout_input(vout, cltv_expiry, sats);
	SweepRequest {
		outpoint: input.outpoint,
		witness: input.witness,
		amount: input.amount,
		height: 800_000,
		fee_preference,
		key: input.key,
	}
}

pub fn conf_request(vout: u32, sats: u64, conf_target: u16) -> SweepRequest {
	request(vout, 800_000, sats, FeePreference::ConfTarget(conf_target))
}

pub fn sweep_address(network: Network) -> Address {
	Address::p2wpkh(&CompressedPublicKey(pubkey(&WALLET_KEY)), network)
}

pub fn p2tr_address(network: Network) -> Address {
	Address::p2tr(&SECP, pubkey(&WALLET_KEY).x_only_public_key().0, None, network)
}

/// A tx of someone else spending the outpoint.
pub fn foreign_spend(outpoint: OutPoint) -> Transaction {
	Transaction {
		version: Version::TWO,
		lock_time: LockTime::ZERO,
		input: vec![TxIn {
			previous_output: outpoint,
			script_sig: ScriptBuf::new(),
			sequence: Sequence::MAX,
			witness: Witness::from_slice(&[[1u8; 32]]),
		}],
		output: vec![TxOut {
			value: Amount::from_sat(1_000),
			script_pubkey: p2tr_address(Network::Regtest).script_pubkey(),
		}],
	}
}

/// A [Signer] with the test keys that can be made to fail.
pub struct FakeSigner {
	inner: KeypairSigner,
	fail: Mutex<HashSet<OutPoint>>,
	hang: AtomicBool,
	calls: AtomicUsize,
}

impl FakeSigner {
	pub fn new() -> FakeSigner {
		FakeSigner {
			inner: KeypairSigner::new(test_keypairs()),
			fail: Mutex::new(HashSet::new()),
			hang: AtomicBool::new(false),
			calls: AtomicUsize::new(0),
		}
	}

	/// Fail all signatures for inputs spending `outpoint`.
	pub fn fail_for(&self, outpoint: OutPoint) {
		self.fail.lock().unwrap().insert(outpoint);
	}

	/// Never answer.
	pub fn hang(&self) {
		self.hang.store(true, Ordering::SeqCst);
	}

	pub fn nb_calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl Signer for FakeSigner {
	async fn sign_output_raw(
		&self,
		tx: &Transaction,
		desc: &SignDescriptor,
	) -> anyhow::Result<ecdsa::Signature> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		if self.hang.load(Ordering::SeqCst) {
			futures::future::pending::<()>().await;
		}
		let prevout = tx.input[desc.input_index].previous_output;
		if self.fail.lock().unwrap().contains(&prevout) {
			bail!("key not available");
		}
		self.inner.sign_output_raw(tx, desc).await
	}
}

/// A [WalletOracle] that hands published txs to the test.
pub struct FakeWallet {
	network: Network,
	fee_rate: Mutex<Option<FeeRate>>,
	conf_targets: Mutex<Vec<u16>>,
	fail_publish: AtomicBool,
	published: Mutex<Vec<Transaction>>,
	published_tx: Option<mpsc::UnboundedSender<Transaction>>,
	calls: AtomicUsize,
}

impl FakeWallet {
	pub fn new(network: Network) -> FakeWallet {
		FakeWallet {
			network,
			fee_rate: Mutex::new(Some(FeeRate::from_sat_per_vb_unchecked(1))),
			conf_targets: Mutex::new(Vec::new()),
			fail_publish: AtomicBool::new(false),
			published: Mutex::new(Vec::new()),
			published_tx: None,
			calls: AtomicUsize::new(0),
		}
	}

	pub fn with_publish_channel(
		network: Network,
	) -> (FakeWallet, mpsc::UnboundedReceiver<Transaction>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let mut wallet = FakeWallet::new(network);
		wallet.published_tx = Some(tx);
		(wallet, rx)
	}

	/// Set the estimated fee rate, [None] makes estimation fail.
	pub fn set_fee_rate(&self, fee_rate: Option<FeeRate>) {
		*self.fee_rate.lock().unwrap() = fee_rate;
	}

	pub fn set_fail_publish(&self, fail: bool) {
		self.fail_publish.store(fail, Ordering::SeqCst);
	}

	/// The conf targets fee rates were estimated for, in order.
	pub fn conf_targets(&self) -> Vec<u16> {
		self.conf_targets.lock().unwrap().clone()
	}

	pub fn nb_published(&self) -> usize {
		self.published.lock().unwrap().len()
	}

	pub fn nb_calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl WalletOracle for FakeWallet {
	async fn estimate_fee_rate(&self, conf_target: u16) -> anyhow::Result<FeeRate> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		self.conf_targets.lock().unwrap().push(conf_target);
		self.fee_rate.lock().unwrap()
			.ok_or_else(|| anyhow!("no fee estimate for conf target {}", conf_target))
	}

	async fn next_address(&self) -> anyhow::Result<Address> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		Ok(sweep_address(self.network))
	}

	async fn publish_transaction(&self, tx: &Transaction) -> anyhow::Result<()> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		if self.fail_publish.load(Ordering::SeqCst) {
			bail!("bad-txns-inputs-missingorspent");
		}
		self.published.lock().unwrap().push(tx.clone());
		if let Some(ref chan) = self.published_tx {
			let _ = chan.send(tx.clone());
		}
		Ok(())
	}
}

#[derive(Default)]
struct NotifierState {
	tip: Option<BlockEpoch>,
	blocks: Vec<fmpsc::UnboundedSender<anyhow::Result<BlockEpoch>>>,
	spends: HashMap<OutPoint, SpendEvent>,
	spend_subs: HashMap<OutPoint, Vec<fmpsc::UnboundedSender<anyhow::Result<SpendEvent>>>>,
	confs: HashMap<Txid, ConfEvent>,
	conf_subs: HashMap<Txid, Vec<fmpsc::UnboundedSender<anyhow::Result<ConfEvent>>>>,
}

/// A [ChainNotifier] driven by the test.
///
/// Events that happen before a watch is registered are delivered on
/// registration.
pub struct FakeNotifier {
	state: Mutex<NotifierState>,
	registrations: AtomicUsize,
	height: AtomicU32,
}

impl FakeNotifier {
	pub fn new() -> FakeNotifier {
		FakeNotifier {
			state: Mutex::new(NotifierState::default()),
			registrations: AtomicUsize::new(0),
			height: AtomicU32::new(0),
		}
	}

	pub fn nb_registrations(&self) -> usize {
		self.registrations.load(Ordering::SeqCst)
	}

	pub fn set_tip(&self, height: u32) {
		self.height.store(height, Ordering::SeqCst);
		let epoch = BlockEpoch {
			height,
			hash: BlockHash::from_byte_array([(height % 256) as u8; 32]),
		};
		let mut state = self.state.lock().unwrap();
		state.tip = Some(epoch);
		state.blocks.retain(|s| s.unbounded_send(Ok(epoch)).is_ok());
	}

	pub fn mine_block(&self) {
		self.set_tip(self.height.load(Ordering::SeqCst) + 1);
	}

	pub fn spend(&self, outpoint: OutPoint, spending_tx: Transaction, height: u32) {
		let event = SpendEvent { outpoint, spending_tx, spending_height: height };
		let mut state = self.state.lock().unwrap();
		if let Some(subs) = state.spend_subs.get_mut(&outpoint) {
			subs.retain(|s| s.unbounded_send(Ok(event.clone())).is_ok());
		}
		state.spends.insert(outpoint, event);
	}

	/// Confirm the tx spending all its inputs.
	pub fn confirm_spends(&self, tx: &Transaction, height: u32) {
		for input in &tx.input {
			self.spend(input.previous_output, tx.clone(), height);
		}
	}

	/// Report the tx as deep enough for any confirmation watch.
	pub fn confirm(&self, tx: &Transaction, height: u32) {
		let txid = tx.compute_txid();
		let event = ConfEvent { txid, block_height: height, tx: tx.clone() };
		let mut state = self.state.lock().unwrap();
		if let Some(subs) = state.conf_subs.get_mut(&txid) {
			subs.retain(|s| s.unbounded_send(Ok(event.clone())).is_ok());
		}
		state.confs.insert(txid, event);
	}
}

#[async_trait]
impl ChainNotifier for FakeNotifier {
	async fn register_spend(
		&self,
		outpoint: OutPoint,
		_pk_script: ScriptBuf,
		_height_hint: u32,
	) -> anyhow::Result<EventStream<SpendEvent>> {
		self.registrations.fetch_add(1, Ordering::SeqCst);
		let (tx, rx) = fmpsc::unbounded();
		let mut state = self.state.lock().unwrap();
		if let Some(event) = state.spends.get(&outpoint) {
			let _ = tx.unbounded_send(Ok(event.clone()));
		}
		state.spend_subs.entry(outpoint).or_default().push(tx);
		Ok(rx.boxed())
	}

	async fn register_confirmation(
		&self,
		txid: Txid,
		_pk_script: ScriptBuf,
		_num_confs: u32,
		_height_hint: u32,
	) -> anyhow::Result<EventStream<ConfEvent>> {
		self.registrations.fetch_add(1, Ordering::SeqCst);
		let (tx, rx) = fmpsc::unbounded();
		let mut state = self.state.lock().unwrap();
		if let Some(event) = state.confs.get(&txid) {
			let _ = tx.unbounded_send(Ok(event.clone()));
		}
		state.conf_subs.entry(txid).or_default().push(tx);
		Ok(rx.boxed())
	}

	async fn register_block_epoch(&self) -> anyhow::Result<EventStream<BlockEpoch>> {
		self.registrations.fetch_add(1, Ordering::SeqCst);
		let (tx, rx) = fmpsc::unbounded();
		let mut state = self.state.lock().unwrap();
		if let Some(tip) = state.tip {
			let _ = tx.unbounded_send(Ok(tip));
		}
		state.blocks.push(tx);
		Ok(rx.boxed())
	}
}
