//! The sweep engine.
//!
//! A single control task owns all sweep state. Callers talk to it through
//! [Sweeper::submit], which queues a request and hands back a
//! [SweepReceiver] that resolves exactly once. All calls to the signer,
//! the wallet and the notifier happen in worker tasks that report their
//! results back to the control task over a channel.
//!
//! A request goes through the following states:
//! - pending: waiting for the batch window to close
//! - immature: the timelock of the input expires above the chain tip
//! - batched: part of a [Batch], being signed or published
//! - spent: one of our transactions spent the input, waiting for
//!   enough confirmations
//!
//! Published batches that don't confirm before their retry deadline are
//! replaced with a higher fee rate, up to a maximum number of attempts.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bitcoin::{Address, Amount, FeeRate, OutPoint, ScriptBuf, Transaction, Txid, Weight};
use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::PublicKey;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use bitcoin_ext::{BlockHeight, TxWeightEstimator};
use swap::SweepWitness;

use crate::batch::{self, SignedSweep, SweepInput, SweepTxError};
use crate::chain::{BlockEpoch, ChainNotifier, ConfEvent, EventStream, Signer, SpendEvent, WalletOracle};
use crate::config::Config;
use crate::error::SweepError;
use crate::fees::{self, FeePreference};
use crate::persist::{SweepRecord, SweepState, SweepStore};
use crate::system::RuntimeManager;


/// Time to wait before registering a failed chain watch again.
const WATCH_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// The outcome of a sweep request.
pub type SweepResult = Result<Transaction, SweepError>;

/// A request to sweep an HTLC output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepRequest {
	pub outpoint: OutPoint,
	pub witness: SweepWitness,
	pub amount: Amount,
	/// Height at which the HTLC output confirmed, used as the height hint
	/// for chain watches.
	pub height: BlockHeight,
	pub fee_preference: FeePreference,
	/// The key to sign the input with.
	pub key: PublicKey,
}

impl SweepRequest {
	pub fn input(&self) -> SweepInput {
		SweepInput {
			outpoint: self.outpoint,
			witness: self.witness.clone(),
			amount: self.amount,
			key: self.key,
		}
	}
}

/// Receives the outcome of a single sweep request.
#[derive(Debug)]
pub struct SweepReceiver {
	rx: oneshot::Receiver<SweepResult>,
}

impl SweepReceiver {
	/// Wait for the request to be resolved.
	///
	/// Resolves with [SweepError::Cancelled] if the sweeper stopped
	/// before resolving the request.
	pub async fn wait(self) -> SweepResult {
		self.rx.await.unwrap_or(Err(SweepError::Cancelled))
	}
}

enum Command {
	Submit {
		req: SweepRequest,
		tx: oneshot::Sender<SweepResult>,
	},
}

/// Handle to a running sweep engine.
pub struct Sweeper {
	cfg: Arc<Config>,
	rtmgr: RuntimeManager,
	signer: Arc<dyn Signer>,
	wallet: Arc<dyn WalletOracle>,
	commands: mpsc::Sender<Command>,
}

impl Sweeper {
	/// Start the sweep engine.
	///
	/// Unfinished sweeps in the store are kept as claimed until their
	/// owners submit them again.
	pub async fn start(
		cfg: Config,
		rtmgr: RuntimeManager,
		signer: Arc<dyn Signer>,
		notifier: Arc<dyn ChainNotifier>,
		wallet: Arc<dyn WalletOracle>,
		store: Arc<dyn SweepStore>,
	) -> anyhow::Result<Sweeper> {
		cfg.validate().context("invalid sweeper config")?;
		let cfg = Arc::new(cfg);

		let unfinished = store.list_unfinished().context("error loading unfinished sweeps")?;
		if !unfinished.is_empty() {
			slog!(SweepsRestored, outpoints: unfinished.iter().map(|r| r.outpoint).collect());
		}

		let (cmd_tx, cmd_rx) = mpsc::channel(cfg.request_queue_size);
		let (event_tx, event_rx) = mpsc::unbounded_channel();

		let mut engine = Engine::new(
			cfg.clone(), rtmgr.clone(), signer.clone(), notifier, wallet.clone(), store, event_tx,
		);
		engine.restore(unfinished);
		engine.watch_blocks();

		let worker = rtmgr.spawn_critical("sweeper");
		tokio::spawn(async move {
			engine.run(cmd_rx, event_rx).await;
			drop(worker);
		});

		Ok(Sweeper { cfg, rtmgr, signer, wallet, commands: cmd_tx })
	}

	/// Submit a sweep request.
	///
	/// Only waits when the request queue is full. Submitting an outpoint
	/// that is already being swept adds another listener to it.
	pub async fn submit(&self, req: SweepRequest) -> SweepReceiver {
		let (tx, rx) = oneshot::channel();
		if self.commands.send(Command::Submit { req, tx }).await.is_err() {
			trace!("Sweeper stopped, dropping sweep request");
		}
		SweepReceiver { rx }
	}

	/// Stop the sweeper, cancelling all unresolved requests.
	///
	/// Calling this more than once has no further effect.
	pub fn shutdown(&self) {
		self.rtmgr.shutdown();
	}

	/// Sign a sweep of `inputs` into `dest` without publishing it.
	pub async fn create_sweep_tx(
		&self,
		inputs: &[SweepInput],
		fee_rate: FeeRate,
		dest: &Address,
	) -> Result<Transaction, SweepError> {
		batch::create_sweep_tx(&*self.signer, inputs, fee_rate, dest, self.cfg.call_timeout).await
	}

	/// Quote the fee of a sweep into `dest` at the configured conf target.
	///
	/// The inputs are added to the weight estimate by `add_input`.
	pub async fn get_sweep_fee(
		&self,
		add_input: impl FnOnce(&mut TxWeightEstimator),
		dest: &Address,
	) -> anyhow::Result<(Amount, Weight)> {
		fees::get_sweep_fee(&*self.wallet, add_input, self.cfg.conf_target, dest).await
	}
}

type BatchId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchStatus {
	Signing,
	Publishing,
	Published {
		next_attempt_height: BlockHeight,
	},
	/// The last attempt failed and will be retried at the given height.
	AwaitingRetry {
		height: BlockHeight,
	},
	/// One of our transactions spent the inputs.
	Confirming,
}

#[derive(Debug)]
struct Batch {
	id: BatchId,
	inputs: Vec<OutPoint>,
	fee_rate: FeeRate,
	/// The number of the transaction currently being created, starting at 1.
	attempt: usize,
	dest: Option<Address>,
	status: BatchStatus,
	/// Incremented for every worker started, so results of stale workers
	/// can be ignored.
	seq: u64,
	last_err: Option<SweepError>,
	/// All transactions signed for this batch.
	txids: Vec<Txid>,
}

impl Batch {
	fn retry_due(&self, tip: BlockHeight) -> bool {
		match self.status {
			BatchStatus::Published { next_attempt_height } => tip >= next_attempt_height,
			BatchStatus::AwaitingRetry { height } => tip >= height,
			BatchStatus::Signing | BatchStatus::Publishing | BatchStatus::Confirming => false,
		}
	}
}

struct Tracked {
	req: SweepRequest,
	listeners: Vec<oneshot::Sender<SweepResult>>,
	record: SweepRecord,
	batch: Option<BatchId>,
	/// Cancels the spend watch of the input.
	watch: CancellationToken,
	/// Our transaction that spent the input.
	spent_by: Option<Txid>,
	/// Set for inputs of which we already broadcast a tx in an earlier run.
	min_fee_rate: Option<FeeRate>,
	restored_txid: Option<Txid>,
}

enum SignFailure {
	Wallet(String),
	Tx(SweepTxError),
}

enum Event {
	FeesResolved(Vec<(OutPoint, FeeRate)>),
	Signed {
		batch: BatchId,
		seq: u64,
		dest: Address,
		result: Result<SignedSweep, SweepTxError>,
	},
	SignFailed {
		batch: BatchId,
		seq: u64,
		failure: SignFailure,
	},
	Published {
		batch: BatchId,
		seq: u64,
		txid: Txid,
		result: Result<(), String>,
	},
	Block(BlockEpoch),
	Spent(SpendEvent),
	Confirmed(ConfEvent),
}

struct Engine {
	cfg: Arc<Config>,
	rtmgr: RuntimeManager,
	signer: Arc<dyn Signer>,
	notifier: Arc<dyn ChainNotifier>,
	wallet: Arc<dyn WalletOracle>,
	store: Arc<dyn SweepStore>,
	events: mpsc::UnboundedSender<Event>,

	tip: BlockHeight,
	tracked: HashMap<OutPoint, Tracked>,
	/// Requests waiting for the batch window, in submission order.
	pending: Vec<OutPoint>,
	/// Requests waiting for their timelock to expire.
	immature: Vec<OutPoint>,
	deadline: Option<Instant>,
	batches: BTreeMap<BatchId, Batch>,
	next_batch_id: BatchId,
	/// Transactions we signed for unresolved sweeps, with the number of
	/// batches and restored records referring to them.
	own_txids: HashMap<Txid, usize>,
	/// Our transactions waiting for enough confirmations.
	confirming: HashMap<Txid, (CancellationToken, Vec<OutPoint>)>,
	/// Unfinished records from an earlier run, not submitted again yet.
	restored: HashMap<OutPoint, SweepRecord>,
}

impl Engine {
	fn new(
		cfg: Arc<Config>,
		rtmgr: RuntimeManager,
		signer: Arc<dyn Signer>,
		notifier: Arc<dyn ChainNotifier>,
		wallet: Arc<dyn WalletOracle>,
		store: Arc<dyn SweepStore>,
		events: mpsc::UnboundedSender<Event>,
	) -> Engine {
		Engine {
			cfg, rtmgr, signer, notifier, wallet, store, events,
			tip: 0,
			tracked: HashMap::new(),
			pending: Vec::new(),
			immature: Vec::new(),
			deadline: None,
			batches: BTreeMap::new(),
			next_batch_id: 0,
			own_txids: HashMap::new(),
			confirming: HashMap::new(),
			restored: HashMap::new(),
		}
	}

	fn restore(&mut self, records: Vec<SweepRecord>) {
		for record in records {
			if let Some(txid) = record.txid {
				self.claim_txid(txid);
			}
			self.restored.insert(record.outpoint, record);
		}
	}

	fn claim_txid(&mut self, txid: Txid) {
		*self.own_txids.entry(txid).or_default() += 1;
	}

	fn release_txid(&mut self, txid: Txid) {
		if let Entry::Occupied(mut e) = self.own_txids.entry(txid) {
			*e.get_mut() -= 1;
			if *e.get() == 0 {
				e.remove();
			}
		}
	}

	/// Whether a tx with this locktime can be mined in the next block.
	fn is_mature(&self, lock_time: LockTime) -> bool {
		// we don't follow median time past, time locks are tried right away
		!lock_time.is_block_height() || lock_time.to_consensus_u32() <= self.tip
	}

	async fn run(
		mut self,
		mut commands: mpsc::Receiver<Command>,
		mut events: mpsc::UnboundedReceiver<Event>,
	) {
		let shutdown = self.rtmgr.shutdown_token();
		let mut commands_open = true;
		loop {
			let deadline = self.deadline;
			tokio::select! {
				_ = shutdown.cancelled() => break,
				cmd = commands.recv(), if commands_open => match cmd {
					Some(Command::Submit { req, tx }) => self.submit(req, tx),
					None => {
						debug!("All sweeper handles dropped, no new requests can come in");
						commands_open = false;
					},
				},
				Some(event) = events.recv() => self.handle_event(event),
				_ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
					if deadline.is_some() => self.flush(),
			}
		}

		commands.close();
		while let Ok(Command::Submit { tx, .. }) = commands.try_recv() {
			let _ = tx.send(Err(SweepError::Cancelled));
		}
		self.cancel_all();
	}

	fn submit(&mut self, req: SweepRequest, listener: oneshot::Sender<SweepResult>) {
		if let Some(tracked) = self.tracked.get_mut(&req.outpoint) {
			slog!(SweepRequestJoined, outpoint: req.outpoint);
			tracked.listeners.push(listener);
			return;
		}

		slog!(SweepRequestReceived, outpoint: req.outpoint, amount: req.amount,
			spend_type: format!("{:?}", req.witness.spend_type()).to_lowercase(),
			fee_preference: req.fee_preference.to_string(),
		);

		let mut min_fee_rate = None;
		let mut restored_txid = None;
		let mut record = SweepRecord::new(req.outpoint);
		if let Some(prev) = self.restored.remove(&req.outpoint) {
			// we might have a tx in the mempool already, replacing it
			// requires a higher fee rate
			min_fee_rate = prev.fee_rate.map(|r| fees::bump_fee_rate(r, &self.cfg));
			restored_txid = prev.txid;
			record.txid = prev.txid;
			record.fee_rate = prev.fee_rate;
			record.attempt = prev.attempt;
		}
		if let Err(e) = self.store.upsert(&record) {
			if let Some(txid) = restored_txid {
				self.release_txid(txid);
			}
			let _ = listener.send(Err(SweepError::store(&e)));
			return;
		}

		let outpoint = req.outpoint;
		let watch = self.watch_spend(outpoint, req.witness.htlc().script_pubkey.clone(), req.height);
		self.tip = self.tip.max(req.height);
		self.tracked.insert(outpoint, Tracked {
			req,
			listeners: vec![listener],
			record,
			batch: None,
			watch,
			spent_by: None,
			min_fee_rate,
			restored_txid,
		});
		self.schedule(outpoint);
	}

	/// Queue the request for the next batch.
	fn schedule(&mut self, outpoint: OutPoint) {
		self.pending.push(outpoint);
		if self.pending.len() >= self.cfg.max_inputs_per_tx {
			self.flush();
		} else if self.deadline.is_none() {
			self.deadline = Some(Instant::now() + self.cfg.batch_window);
		}
	}

	/// Resolve fee rates for all pending requests so they can be batched.
	fn flush(&mut self) {
		self.deadline = None;
		let pending = mem::take(&mut self.pending);
		if pending.is_empty() {
			return;
		}

		let prefs = pending.into_iter()
			.filter_map(|op| self.tracked.get(&op).map(|t| (op, t.req.fee_preference)))
			.collect::<Vec<_>>();
		let wallet = self.wallet.clone();
		let cfg = self.cfg.clone();
		self.spawn_worker("sweep-fee-planner", async move {
			let mut estimates = HashMap::<u16, FeeRate>::new();
			let mut rates = Vec::with_capacity(prefs.len());
			for (op, pref) in prefs {
				let rate = match pref {
					FeePreference::ConfTarget(t) if estimates.contains_key(&t) => estimates[&t],
					pref => {
						let rate = fees::resolve_fee_rate(
							&*wallet, pref, cfg.call_timeout, cfg.fallback_fee_rate,
						).await;
						if let FeePreference::ConfTarget(t) = pref {
							estimates.insert(t, rate);
						}
						rate
					},
				};
				rates.push((op, rate));
			}
			Event::FeesResolved(rates)
		});
	}

	fn handle_event(&mut self, event: Event) {
		match event {
			Event::FeesResolved(rates) => self.form_batches(rates),
			Event::Signed { batch, seq, dest, result } => self.on_signed(batch, seq, dest, result),
			Event::SignFailed { batch, seq, failure } => self.on_sign_failed(batch, seq, failure),
			Event::Published { batch, seq, txid, result } => {
				self.on_published(batch, seq, txid, result)
			},
			Event::Block(epoch) => self.on_block(epoch),
			Event::Spent(spend) => self.on_spend(spend),
			Event::Confirmed(conf) => self.on_confirmed(conf),
		}
	}

	/// Group requests by fee bucket and locktime, in submission order.
	///
	/// Requests with a timelock above the tip are held back until it expires.
	fn form_batches(&mut self, rates: Vec<(OutPoint, FeeRate)>) {
		let mut groups = Vec::<((u64, LockTime), Vec<(OutPoint, FeeRate)>)>::new();
		for (op, rate) in rates {
			let tracked = match self.tracked.get(&op) {
				Some(t) if t.batch.is_none() && t.spent_by.is_none() => t,
				_ => continue,
			};
			let lock_time = tracked.req.witness.lock_time();
			if !self.is_mature(lock_time) {
				debug!("Holding sweep of {} until its timelock {} expires", op, lock_time);
				self.immature.push(op);
				continue;
			}

			let mut rate = rate.min(self.cfg.max_fee_rate);
			if let Some(min) = tracked.min_fee_rate {
				rate = rate.max(min);
			}

			let key = (fees::fee_bucket(rate, self.cfg.fee_rate_bucket_size), lock_time);
			match groups.iter_mut().find(|(k, _)| *k == key) {
				Some((_, group)) => group.push((op, rate)),
				None => groups.push((key, vec![(op, rate)])),
			}
		}

		for (_, group) in groups {
			for chunk in group.chunks(self.cfg.max_inputs_per_tx) {
				let fee_rate = chunk.iter().map(|(_, r)| *r).max().expect("chunks are not empty");
				let inputs = chunk.iter().map(|(op, _)| *op).collect();
				let id = self.new_batch(inputs, fee_rate, 1, None, Vec::new());
				slog!(SweepBatchFormed, batch_id: id, inputs: self.batches[&id].inputs.clone(), fee_rate);
				if let Err(e) = self.persist_batch(id, SweepState::Batched) {
					self.fail_batch(id, SweepError::store(&e));
					continue;
				}
				self.start_signing(id);
			}
		}
	}

	fn new_batch(
		&mut self,
		inputs: Vec<OutPoint>,
		fee_rate: FeeRate,
		attempt: usize,
		dest: Option<Address>,
		txids: Vec<Txid>,
	) -> BatchId {
		let id = self.next_batch_id;
		self.next_batch_id += 1;
		for op in &inputs {
			if let Some(t) = self.tracked.get_mut(op) {
				t.batch = Some(id);
			}
		}
		for txid in &txids {
			self.claim_txid(*txid);
		}
		self.batches.insert(id, Batch {
			id, inputs, fee_rate, attempt, dest, txids,
			status: BatchStatus::Signing,
			seq: 0,
			last_err: None,
		});
		id
	}

	/// Drop the batch, forgetting the txs signed for it.
	fn remove_batch(&mut self, id: BatchId) -> Option<Batch> {
		let batch = self.batches.remove(&id)?;
		for txid in &batch.txids {
			self.release_txid(*txid);
		}
		Some(batch)
	}

	fn persist_batch(&mut self, id: BatchId, state: SweepState) -> anyhow::Result<()> {
		let batch = &self.batches[&id];
		for op in &batch.inputs {
			let tracked = self.tracked.get_mut(op).expect("batch inputs are tracked");
			tracked.record.state = state;
			tracked.record.attempt = batch.attempt;
			self.store.upsert(&tracked.record)?;
		}
		Ok(())
	}

	fn start_signing(&mut self, id: BatchId) {
		let batch = self.batches.get_mut(&id).expect("batch exists");
		batch.seq += 1;
		batch.status = BatchStatus::Signing;
		let (seq, fee_rate, dest) = (batch.seq, batch.fee_rate, batch.dest.clone());
		let inputs = batch.inputs.iter()
			.map(|op| self.tracked[op].req.input())
			.collect::<Vec<_>>();

		let signer = self.signer.clone();
		let wallet = self.wallet.clone();
		let call_timeout = self.cfg.call_timeout;
		self.spawn_worker("sweep-signer", async move {
			let dest = match dest {
				Some(d) => d,
				None => {
					let res = tokio::time::timeout(call_timeout, wallet.next_address()).await
						.context("wallet timed out")
						.and_then(|r| r)
						.context("error getting sweep address");
					match res {
						Ok(d) => d,
						Err(e) => return Event::SignFailed {
							batch: id, seq, failure: SignFailure::Wallet(format!("{:#}", e)),
						},
					}
				},
			};
			let result = batch::build_sweep_tx(&*signer, &inputs, fee_rate, &dest, call_timeout).await;
			Event::Signed { batch: id, seq, dest, result }
		});
	}

	/// Get the batch if the worker result with `seq` is still current.
	fn current_batch(&mut self, id: BatchId, seq: u64, status: BatchStatus) -> Option<&mut Batch> {
		match self.batches.get_mut(&id) {
			Some(b) if b.seq == seq && b.status == status => Some(b),
			_ => {
				trace!("Ignoring stale worker result for batch {}", id);
				None
			},
		}
	}

	fn on_signed(
		&mut self,
		id: BatchId,
		seq: u64,
		dest: Address,
		result: Result<SignedSweep, SweepTxError>,
	) {
		let Some(batch) = self.current_batch(id, seq, BatchStatus::Signing) else { return };
		batch.dest = Some(dest);
		let (attempt, fee_rate, inputs) = (batch.attempt, batch.fee_rate, batch.inputs.clone());

		let signed = match result {
			Ok(s) => s,
			Err(e) => return self.on_sign_failed(id, seq, SignFailure::Tx(e)),
		};

		let txid = signed.tx.compute_txid();
		slog!(SweepTxSigned, batch_id: id, txid, attempt, fee: signed.fee);
		self.batches.get_mut(&id).expect("batch exists").txids.push(txid);
		self.claim_txid(txid);

		// the store must know about the tx before anyone else can
		for op in &inputs {
			let tracked = self.tracked.get_mut(op).expect("batch inputs are tracked");
			tracked.record.txid = Some(txid);
			tracked.record.fee_rate = Some(fee_rate);
		}
		if let Err(e) = self.persist_batch(id, SweepState::Broadcast) {
			self.fail_batch(id, SweepError::store(&e));
			return;
		}

		let batch = self.batches.get_mut(&id).expect("batch exists");
		batch.seq += 1;
		batch.status = BatchStatus::Publishing;
		let seq = batch.seq;

		let wallet = self.wallet.clone();
		let call_timeout = self.cfg.call_timeout;
		let tx = signed.tx;
		self.spawn_worker("sweep-publisher", async move {
			let result = tokio::time::timeout(call_timeout, wallet.publish_transaction(&tx)).await
				.context("wallet timed out")
				.and_then(|r| r)
				.map_err(|e| format!("{:#}", e));
			Event::Published { batch: id, seq, txid, result }
		});
	}

	fn on_sign_failed(&mut self, id: BatchId, seq: u64, failure: SignFailure) {
		let tip = self.tip;
		let Some(batch) = self.current_batch(id, seq, BatchStatus::Signing) else { return };

		match failure {
			SignFailure::Wallet(err) => {
				warn!("Failed to create sweep tx for batch {}: {}", id, err);
				batch.last_err = Some(SweepError::BroadcastFailure(err));
				batch.status = BatchStatus::AwaitingRetry { height: tip + 1 };
			},
			SignFailure::Tx(e @ SweepTxError::Signer { .. }) => {
				slog!(SweepSignFailed, batch_id: id, inputs: batch.inputs.clone(), err: e.to_string());
				if batch.inputs.len() > 1 {
					// retry every input on its own so that one bad input
					// doesn't hold back the others
					let batch = self.remove_batch(id).expect("batch exists");
					for op in batch.inputs {
						let single = self.new_batch(
							vec![op], batch.fee_rate, batch.attempt, batch.dest.clone(),
							batch.txids.clone(),
						);
						self.start_signing(single);
					}
				} else {
					self.fail_batch(id, e.into());
				}
			},
			SignFailure::Tx(SweepTxError::Uneconomical { total, fee }) => {
				slog!(SweepUneconomical, batch_id: id, total_input: total, fee);
				self.fail_batch(id, SweepTxError::Uneconomical { total, fee }.into());
			},
			SignFailure::Tx(e) => {
				error!("Failed to create sweep tx for batch {}: {}", id, e);
				self.fail_batch(id, e.into());
			},
		}
	}

	fn on_published(&mut self, id: BatchId, seq: u64, txid: Txid, result: Result<(), String>) {
		let tip = self.tip;
		let cfg = self.cfg.clone();
		let Some(batch) = self.current_batch(id, seq, BatchStatus::Publishing) else { return };

		match result {
			Ok(()) => {
				let next_attempt_height = tip + fees::retry_delta(batch.attempt, &cfg);
				slog!(SweepTxPublished, batch_id: id, txid, attempt: batch.attempt,
					fee_rate: batch.fee_rate, next_attempt_height,
				);
				batch.last_err = None;
				batch.status = BatchStatus::Published { next_attempt_height };
			},
			Err(err) => {
				slog!(SweepPublishFailed, batch_id: id, txid, attempt: batch.attempt, err: err.clone());
				batch.last_err = Some(SweepError::BroadcastFailure(err));
				batch.status = BatchStatus::AwaitingRetry { height: tip + 1 };
			},
		}
	}

	fn on_block(&mut self, epoch: BlockEpoch) {
		trace!("New block tip {} at height {}", epoch.hash, epoch.height);
		self.tip = self.tip.max(epoch.height);

		let due = self.batches.values()
			.filter(|b| b.retry_due(self.tip))
			.map(|b| b.id)
			.collect::<Vec<_>>();
		for id in due {
			self.retry_batch(id);
		}

		let (matured, immature) = mem::take(&mut self.immature).into_iter()
			.filter(|op| self.tracked.contains_key(op))
			.partition::<Vec<_>, _>(|op| self.is_mature(self.tracked[op].req.witness.lock_time()));
		self.immature = immature;
		for op in matured {
			self.schedule(op);
		}
	}

	/// Replace the batch tx with one paying a higher fee rate, or give up.
	fn retry_batch(&mut self, id: BatchId) {
		let cfg = self.cfg.clone();
		let batch = self.batches.get_mut(&id).expect("batch exists");

		if batch.attempt >= cfg.max_sweep_attempts {
			slog!(SweepExhausted, batch_id: id, inputs: batch.inputs.clone(), attempts: batch.attempt);
			let err = match batch.last_err.take() {
				Some(e @ SweepError::BroadcastFailure(_)) => e,
				_ => SweepError::SweepExhausted { attempts: batch.attempt },
			};
			self.fail_batch(id, err);
			return;
		}

		let old_fee_rate = batch.fee_rate;
		batch.attempt += 1;
		batch.fee_rate = fees::bump_fee_rate(old_fee_rate, &cfg);
		slog!(SweepFeeBumped, batch_id: id, attempt: batch.attempt,
			old_fee_rate, new_fee_rate: batch.fee_rate,
		);

		if let Err(e) = self.persist_batch(id, SweepState::Batched) {
			self.fail_batch(id, SweepError::store(&e));
			return;
		}
		self.start_signing(id);
	}

	fn on_spend(&mut self, spend: SpendEvent) {
		let outpoint = spend.outpoint;
		let txid = spend.spending_tx.compute_txid();
		let Some(tracked) = self.tracked.get_mut(&outpoint) else { return };
		if tracked.spent_by == Some(txid) {
			return;
		}
		slog!(SweepInputSpent, outpoint, spending_txid: txid, height: spend.spending_height);

		if !self.own_txids.contains_key(&txid) {
			slog!(SweepRemoteSpend, outpoint, spending_txid: txid);
			let remaining = self.resolve(outpoint, Err(SweepError::RemoteSpend { txid }), Some(SweepState::Failed));
			if let Some(id) = remaining {
				if self.batches[&id].status != BatchStatus::Confirming {
					self.start_signing(id);
				}
			}
			return;
		}

		tracked.spent_by = Some(txid);
		tracked.watch.cancel();
		if let Some(id) = tracked.batch {
			if let Some(batch) = self.batches.get_mut(&id) {
				batch.status = BatchStatus::Confirming;
			}
		}

		if self.cfg.confirmation_depth <= 1 {
			slog!(SweepConfirmed, txid, inputs: vec![outpoint]);
			self.resolve(outpoint, Ok(spend.spending_tx), Some(SweepState::Confirmed));
			return;
		}

		if let Some((_, inputs)) = self.confirming.get_mut(&txid) {
			inputs.push(outpoint);
			return;
		}
		let pk_script = spend.spending_tx.output.first()
			.map(|o| o.script_pubkey.clone())
			.unwrap_or_default();
		let token = self.watch_confirmation(txid, pk_script, spend.spending_height);
		self.confirming.insert(txid, (token, vec![outpoint]));
	}

	fn on_confirmed(&mut self, conf: ConfEvent) {
		let Some((token, inputs)) = self.confirming.remove(&conf.txid) else { return };
		token.cancel();
		slog!(SweepConfirmed, txid: conf.txid, inputs: inputs.clone());
		for op in inputs {
			self.resolve(op, Ok(conf.tx.clone()), Some(SweepState::Confirmed));
		}
	}

	fn fail_batch(&mut self, id: BatchId, err: SweepError) {
		if let Some(batch) = self.remove_batch(id) {
			for op in batch.inputs {
				self.resolve(op, Err(err.clone()), Some(SweepState::Failed));
			}
		}
	}

	/// Deliver the outcome to all listeners and stop tracking the request.
	///
	/// Returns the request's batch if it still has other inputs.
	fn resolve(
		&mut self,
		outpoint: OutPoint,
		result: SweepResult,
		state: Option<SweepState>,
	) -> Option<BatchId> {
		let mut tracked = self.tracked.remove(&outpoint)?;
		tracked.watch.cancel();
		self.pending.retain(|op| *op != outpoint);
		self.immature.retain(|op| *op != outpoint);
		if let Some(txid) = tracked.restored_txid {
			self.release_txid(txid);
		}

		if let Some(state) = state {
			tracked.record.state = state;
			if let Err(e) = self.store.upsert(&tracked.record) {
				error!("Failed to store final state {} of sweep of {}: {:#}", state, outpoint, e);
			}
		}

		for listener in tracked.listeners {
			let _ = listener.send(result.clone());
		}

		let id = tracked.batch?;
		let batch = self.batches.get_mut(&id)?;
		batch.inputs.retain(|op| *op != outpoint);
		if batch.inputs.is_empty() {
			self.remove_batch(id);
			None
		} else {
			Some(id)
		}
	}

	/// Resolve everything with [SweepError::Cancelled].
	///
	/// The store is left untouched so the sweeps are picked up again after
	/// a restart.
	fn cancel_all(&mut self) {
		let nb_cancelled = self.tracked.len();
		for (_, tracked) in self.tracked.drain() {
			tracked.watch.cancel();
			for listener in tracked.listeners {
				let _ = listener.send(Err(SweepError::Cancelled));
			}
		}
		for (_, (token, _)) in self.confirming.drain() {
			token.cancel();
		}
		self.batches.clear();
		self.own_txids.clear();
		self.pending.clear();
		self.immature.clear();
		self.deadline = None;
		slog!(SweeperShutdown, nb_cancelled);
	}

	fn spawn_worker<F>(&self, name: &'static str, work: F)
	where
		F: Future<Output = Event> + Send + 'static,
	{
		let worker = self.rtmgr.spawn(name);
		let shutdown = self.rtmgr.shutdown_token();
		let events = self.events.clone();
		tokio::spawn(async move {
			let _worker = worker;
			tokio::select! {
				// in-flight calls are abandoned on shutdown
				_ = shutdown.cancelled() => {},
				event = work => {
					let _ = events.send(event);
				},
			}
		});
	}

	fn watch_blocks(&self) {
		let notifier = self.notifier.clone();
		let call_timeout = self.cfg.call_timeout;
		self.spawn_watch("block-watcher", self.rtmgr.shutdown_token(), Event::Block, move || {
			let notifier = notifier.clone();
			async move {
				tokio::time::timeout(call_timeout, notifier.register_block_epoch()).await
					.context("notifier timed out")?
			}
		});
	}

	fn watch_spend(
		&self,
		outpoint: OutPoint,
		pk_script: ScriptBuf,
		height_hint: BlockHeight,
	) -> CancellationToken {
		let token = self.rtmgr.shutdown_token().child_token();
		let notifier = self.notifier.clone();
		let call_timeout = self.cfg.call_timeout;
		self.spawn_watch("spend-watcher", token.clone(), Event::Spent, move || {
			let notifier = notifier.clone();
			let pk_script = pk_script.clone();
			async move {
				let fut = notifier.register_spend(outpoint, pk_script, height_hint);
				tokio::time::timeout(call_timeout, fut).await.context("notifier timed out")?
			}
		});
		token
	}

	fn watch_confirmation(
		&self,
		txid: Txid,
		pk_script: ScriptBuf,
		height_hint: BlockHeight,
	) -> CancellationToken {
		let token = self.rtmgr.shutdown_token().child_token();
		let notifier = self.notifier.clone();
		let call_timeout = self.cfg.call_timeout;
		let num_confs = self.cfg.confirmation_depth;
		self.spawn_watch("conf-watcher", token.clone(), Event::Confirmed, move || {
			let notifier = notifier.clone();
			let pk_script = pk_script.clone();
			async move {
				let fut = notifier.register_confirmation(txid, pk_script, num_confs, height_hint);
				tokio::time::timeout(call_timeout, fut).await.context("notifier timed out")?
			}
		});
		token
	}

	/// Forward the events of a chain watch until `cancel` fires.
	///
	/// The watch is registered again when registration fails or the
	/// stream ends.
	fn spawn_watch<T, R, Fut>(
		&self,
		name: &'static str,
		cancel: CancellationToken,
		into_event: fn(T) -> Event,
		register: R,
	)
	where
		T: Send + 'static,
		R: Fn() -> Fut + Send + 'static,
		Fut: Future<Output = anyhow::Result<EventStream<T>>> + Send + 'static,
	{
		let worker = self.rtmgr.spawn(name);
		let events = self.events.clone();
		tokio::spawn(async move {
			let _worker = worker;
			loop {
				let registered = tokio::select! {
					_ = cancel.cancelled() => return,
					r = register() => r,
				};
				match registered {
					Ok(mut stream) => loop {
						let item = tokio::select! {
							_ = cancel.cancelled() => return,
							item = stream.next() => item,
						};
						match item {
							Some(Ok(item)) => {
								if events.send(into_event(item)).is_err() {
									return;
								}
							},
							Some(Err(e)) => {
								warn!("{} stream error, registering again: {:#}", name, e);
								break;
							},
							None => {
								warn!("{} stream ended, registering again", name);
								break;
							},
						}
					},
					Err(e) => warn!("{} failed to register: {:#}", name, e),
				}

				tokio::select! {
					_ = cancel.cancelled() => return,
					_ = tokio::time::sleep(WATCH_RETRY_INTERVAL) => {},
				}
			}
		});
	}
}
