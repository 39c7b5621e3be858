
use bitcoin::Txid;

use swap::PreimageMismatch;


/// Terminal outcome of a sweep request that didn't confirm.
///
/// The same error can be delivered to several listeners of an outpoint,
/// so underlying errors are kept as their rendered messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SweepError {
	#[error("{0}")]
	PreimageMismatch(#[from] PreimageMismatch),
	#[error("signer failure: {0}")]
	SignerFailure(String),
	#[error("broadcast failure: {0}")]
	BroadcastFailure(String),
	#[error("sweep did not confirm after {attempts} attempts")]
	SweepExhausted {
		attempts: usize,
	},
	#[error("input was spent by foreign transaction {txid}")]
	RemoteSpend {
		txid: Txid,
	},
	#[error("sweep store failure: {0}")]
	Store(String),
	#[error("sweeper was shut down")]
	Cancelled,
}

impl SweepError {
	pub fn signer(err: impl std::fmt::Display) -> SweepError {
		SweepError::SignerFailure(err.to_string())
	}

	pub fn broadcast(err: impl std::fmt::Display) -> SweepError {
		SweepError::BroadcastFailure(err.to_string())
	}

	pub fn store(err: &anyhow::Error) -> SweepError {
		SweepError::Store(format!("{:#}", err))
	}
}
