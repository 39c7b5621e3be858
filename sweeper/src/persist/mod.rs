
mod sqlite;

pub use self::sqlite::SqliteStore;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use bitcoin::{FeeRate, OutPoint, Txid};


/// Lifecycle state of a swept outpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SweepState {
	Submitted,
	Batched,
	Broadcast,
	Confirmed,
	Failed,
	Cancelled,
}

impl SweepState {
	pub fn as_str(&self) -> &'static str {
		match self {
			SweepState::Submitted => "submitted",
			SweepState::Batched => "batched",
			SweepState::Broadcast => "broadcast",
			SweepState::Confirmed => "confirmed",
			SweepState::Failed => "failed",
			SweepState::Cancelled => "cancelled",
		}
	}

	/// Whether no further transitions can happen from this state.
	pub fn is_terminal(&self) -> bool {
		match self {
			SweepState::Confirmed | SweepState::Failed | SweepState::Cancelled => true,
			SweepState::Submitted | SweepState::Batched | SweepState::Broadcast => false,
		}
	}
}

impl fmt::Display for SweepState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SweepState {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s {
			"submitted" => SweepState::Submitted,
			"batched" => SweepState::Batched,
			"broadcast" => SweepState::Broadcast,
			"confirmed" => SweepState::Confirmed,
			"failed" => SweepState::Failed,
			"cancelled" => SweepState::Cancelled,
			_ => bail!("unknown sweep state: {}", s),
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepRecord {
	pub outpoint: OutPoint,
	pub state: SweepState,
	/// The fee rate of the last transaction that spent this outpoint.
	pub fee_rate: Option<FeeRate>,
	/// The last transaction that spent this outpoint.
	pub txid: Option<Txid>,
	/// Number of transactions created for this outpoint so far.
	pub attempt: usize,
}

impl SweepRecord {
	pub fn new(outpoint: OutPoint) -> SweepRecord {
		SweepRecord {
			outpoint,
			state: SweepState::Submitted,
			fee_rate: None,
			txid: None,
			attempt: 0,
		}
	}
}

/// Durable mapping from outpoint to its sweep state.
///
/// Every method must have made its change durable when it returns.
pub trait SweepStore: Send + Sync + 'static {
	/// Insert the record or replace the existing record for its outpoint.
	fn upsert(&self, record: &SweepRecord) -> anyhow::Result<()>;

	fn get(&self, outpoint: OutPoint) -> anyhow::Result<Option<SweepRecord>>;

	/// All records in a non-terminal state.
	fn list_unfinished(&self) -> anyhow::Result<Vec<SweepRecord>>;
}

/// A [SweepStore] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
	records: Mutex<HashMap<OutPoint, SweepRecord>>,
}

impl MemoryStore {
	pub fn new() -> MemoryStore {
		MemoryStore::default()
	}
}

impl SweepStore for MemoryStore {
	fn upsert(&self, record: &SweepRecord) -> anyhow::Result<()> {
		self.records.lock().expect("poisoned lock").insert(record.outpoint, record.clone());
		Ok(())
	}

	fn get(&self, outpoint: OutPoint) -> anyhow::Result<Option<SweepRecord>> {
		Ok(self.records.lock().expect("poisoned lock").get(&outpoint).cloned())
	}

	fn list_unfinished(&self) -> anyhow::Result<Vec<SweepRecord>> {
		let records = self.records.lock().expect("poisoned lock");
		let mut ret = records.values()
			.filter(|r| !r.state.is_terminal())
			.cloned()
			.collect::<Vec<_>>();
		ret.sort_by_key(|r| r.outpoint);
		Ok(ret)
	}
}
