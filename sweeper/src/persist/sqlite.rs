
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use bitcoin::{FeeRate, OutPoint, Txid};
use rusqlite::{Connection, Row};

use crate::config::Config;

use super::{SweepRecord, SweepState, SweepStore};


const CREATE_TABLE: &str = r"
	CREATE TABLE IF NOT EXISTS sweeper_sweeps (
		outpoint TEXT PRIMARY KEY,
		state TEXT NOT NULL,
		fee_rate_kwu INTEGER,
		txid TEXT,
		attempt INTEGER NOT NULL,
		updated_at DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
	);
";

/// A [SweepStore] backed by a sqlite database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
	connection_string: PathBuf,
}

impl SqliteStore {
	/// Open the database at the given path, creating it if needed.
	pub fn open(db_file: impl AsRef<Path>) -> anyhow::Result<SqliteStore> {
		let path = db_file.as_ref().to_path_buf();

		debug!("Opening sweep database at {}", path.display());
		let conn = Connection::open(&path)
			.with_context(|| format!("Error connecting to database {}", path.display()))?;
		conn.execute_batch(CREATE_TABLE).context("error creating sweeps table")?;

		Ok(SqliteStore { connection_string: path })
	}

	/// Open the database configured in [Config::db_path].
	pub fn from_config(cfg: &Config) -> anyhow::Result<SqliteStore> {
		SqliteStore::open(&cfg.db_path)
	}

	fn connect(&self) -> anyhow::Result<Connection> {
		Connection::open(&self.connection_string)
			.with_context(|| format!("Error connecting to database {}", self.connection_string.display()))
	}
}

fn record_from_row(row: &Row<'_>) -> anyhow::Result<SweepRecord> {
	let outpoint = OutPoint::from_str(&row.get::<_, String>("outpoint")?)?;
	let state = SweepState::from_str(&row.get::<_, String>("state")?)?;
	let fee_rate = row.get::<_, Option<u64>>("fee_rate_kwu")?.map(FeeRate::from_sat_per_kwu);
	let txid = match row.get::<_, Option<String>>("txid")? {
		Some(txid) => Some(Txid::from_str(&txid)?),
		None => None,
	};
	let attempt = row.get::<_, i64>("attempt")?;

	Ok(SweepRecord {
		outpoint,
		state,
		fee_rate,
		txid,
		attempt: usize::try_from(attempt).context("negative attempt count")?,
	})
}

impl SweepStore for SqliteStore {
	fn upsert(&self, record: &SweepRecord) -> anyhow::Result<()> {
		let query = r"
			INSERT INTO sweeper_sweeps (outpoint, state, fee_rate_kwu, txid, attempt)
			VALUES (?1, ?2, ?3, ?4, ?5)
			ON CONFLICT (outpoint) DO UPDATE
			SET
				state = EXCLUDED.state,
				fee_rate_kwu = EXCLUDED.fee_rate_kwu,
				txid = EXCLUDED.txid,
				attempt = EXCLUDED.attempt,
				updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now');
		";

		let conn = self.connect()?;
		conn.execute(query, (
			record.outpoint.to_string(),
			record.state.as_str(),
			record.fee_rate.map(|f| f.to_sat_per_kwu()),
			record.txid.map(|t| t.to_string()),
			record.attempt as i64,
		)).with_context(|| format!("error storing sweep record for {}", record.outpoint))?;
		Ok(())
	}

	fn get(&self, outpoint: OutPoint) -> anyhow::Result<Option<SweepRecord>> {
		let query = r"
			SELECT outpoint, state, fee_rate_kwu, txid, attempt
			FROM sweeper_sweeps WHERE outpoint = ?1;
		";

		let conn = self.connect()?;
		let mut statement = conn.prepare(query)?;
		let mut rows = statement.query([outpoint.to_string()])?;
		match rows.next()? {
			Some(row) => Ok(Some(record_from_row(row)?)),
			None => Ok(None),
		}
	}

	fn list_unfinished(&self) -> anyhow::Result<Vec<SweepRecord>> {
		let query = r"
			SELECT outpoint, state, fee_rate_kwu, txid, attempt
			FROM sweeper_sweeps
			WHERE state NOT IN ('confirmed', 'failed', 'cancelled')
			ORDER BY updated_at, outpoint;
		";

		let conn = self.connect()?;
		let mut statement = conn.prepare(query)?;
		let mut rows = statement.query([])?;
		let mut result = Vec::new();
		while let Some(row) = rows.next()? {
			result.push(record_from_row(row)?);
		}
		Ok(result)
	}
}

impl SqliteStore {
	/// Number of records in the database, terminal ones included.
	pub fn count(&self) -> anyhow::Result<usize> {
		let conn = self.connect()?;
		let count = conn.query_row("SELECT COUNT(*) FROM sweeper_sweeps;", [], |r| r.get::<_, i64>(0))?;
		Ok(count as usize)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use bitcoin::hashes::Hash;

	fn temp_db() -> PathBuf {
		std::env::temp_dir().join(format!("sweeper-test-{}.sqlite", rand::random::<u64>()))
	}

	#[test]
	fn sqlite_store() {
		let path = temp_db();
		let store = SqliteStore::open(&path).unwrap();

		let op = OutPoint::new(Txid::all_zeros(), 3);
		assert_eq!(store.get(op).unwrap(), None);

		let mut rec = SweepRecord::new(op);
		store.upsert(&rec).unwrap();
		assert_eq!(store.get(op).unwrap(), Some(rec.clone()));

		rec.state = SweepState::Broadcast;
		rec.fee_rate = Some(FeeRate::from_sat_per_kwu(253));
		rec.txid = Some(Txid::from_byte_array([7; 32]));
		rec.attempt = 2;
		store.upsert(&rec).unwrap();
		assert_eq!(store.get(op).unwrap(), Some(rec.clone()));
		assert_eq!(store.list_unfinished().unwrap(), vec![rec.clone()]);

		// a second handle on the same file sees the same data
		let reopened = SqliteStore::open(&path).unwrap();
		assert_eq!(reopened.get(op).unwrap(), Some(rec.clone()));

		rec.state = SweepState::Confirmed;
		store.upsert(&rec).unwrap();
		assert!(store.list_unfinished().unwrap().is_empty());
		assert_eq!(store.count().unwrap(), 1);

		std::fs::remove_file(&path).unwrap();
	}

	#[test]
	fn open_configured_db() {
		let mut cfg = Config::default();
		cfg.db_path = temp_db();
		let store = SqliteStore::from_config(&cfg).unwrap();
		store.upsert(&SweepRecord::new(OutPoint::new(Txid::all_zeros(), 0))).unwrap();

		let reopened = SqliteStore::open(&cfg.db_path).unwrap();
		assert_eq!(reopened.count().unwrap(), 1);
		std::fs::remove_file(&cfg.db_path).unwrap();
	}
}
