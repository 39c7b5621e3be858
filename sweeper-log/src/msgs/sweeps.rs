
use bitcoin::{Amount, FeeRate, OutPoint, Txid};
use bitcoin_ext::BlockHeight;


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepRequestReceived {
	pub outpoint: OutPoint,
	pub amount: Amount,
	pub spend_type: String,
	pub fee_preference: String,
}
impl_slog!(SweepRequestReceived, Debug, "received a new sweep request");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepRequestJoined {
	pub outpoint: OutPoint,
}
impl_slog!(SweepRequestJoined, Debug, "outpoint already being swept, added a listener");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepsRestored {
	pub outpoints: Vec<OutPoint>,
}
impl_slog!(SweepsRestored, Info, "found unfinished sweeps in the store");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeEstimateFallback {
	pub conf_target: u16,
	pub fallback: FeeRate,
	pub err: String,
}
impl_slog!(FeeEstimateFallback, Warn, "fee estimation failed, using fallback fee rate");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepBatchFormed {
	pub batch_id: u64,
	pub inputs: Vec<OutPoint>,
	pub fee_rate: FeeRate,
}
impl_slog!(SweepBatchFormed, Info, "formed a new sweep batch");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepTxSigned {
	pub batch_id: u64,
	pub txid: Txid,
	pub attempt: usize,
	pub fee: Amount,
}
impl_slog!(SweepTxSigned, Debug, "signed sweep transaction");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSignFailed {
	pub batch_id: u64,
	pub inputs: Vec<OutPoint>,
	pub err: String,
}
impl_slog!(SweepSignFailed, Warn, "failed to sign sweep transaction");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepUneconomical {
	pub batch_id: u64,
	pub total_input: Amount,
	pub fee: Amount,
}
impl_slog!(SweepUneconomical, Warn, "sweep fee exceeds the swept value");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepTxPublished {
	pub batch_id: u64,
	pub txid: Txid,
	pub attempt: usize,
	pub fee_rate: FeeRate,
	pub next_attempt_height: BlockHeight,
}
impl_slog!(SweepTxPublished, Info, "published sweep transaction");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepPublishFailed {
	pub batch_id: u64,
	pub txid: Txid,
	pub attempt: usize,
	pub err: String,
}
impl_slog!(SweepPublishFailed, Warn, "failed to publish sweep transaction");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepFeeBumped {
	pub batch_id: u64,
	pub attempt: usize,
	pub old_fee_rate: FeeRate,
	pub new_fee_rate: FeeRate,
}
impl_slog!(SweepFeeBumped, Info, "sweep not confirmed in time, bumping fee");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepInputSpent {
	pub outpoint: OutPoint,
	pub spending_txid: Txid,
	pub height: BlockHeight,
}
impl_slog!(SweepInputSpent, Debug, "sweep input spent on chain");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfirmed {
	pub txid: Txid,
	pub inputs: Vec<OutPoint>,
}
impl_slog!(SweepConfirmed, Info, "sweep transaction confirmed");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepRemoteSpend {
	pub outpoint: OutPoint,
	pub spending_txid: Txid,
}
impl_slog!(SweepRemoteSpend, Warn, "sweep input was spent by a foreign transaction");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepExhausted {
	pub batch_id: u64,
	pub inputs: Vec<OutPoint>,
	pub attempts: usize,
}
impl_slog!(SweepExhausted, Error, "giving up on sweep after maximum attempts");
