
extern crate bitcoin as cbitcoin;

mod bitcoin;
pub use bitcoin::{FeeRateExt, TransactionExt};

pub mod weight;
pub use weight::TxWeightEstimator;


use cbitcoin::absolute::LockTime;


/// Type representing a block height in the bitcoin blockchain.
pub type BlockHeight = u32;

/// The witness scale factor used to convert vbytes into weight units.
pub const WITNESS_SCALE_FACTOR: usize = 4;

/// Returns the highest of two locktimes of the same unit.
///
/// Returns [None] when one is block-based and the other time-based.
pub fn max_locktime(a: LockTime, b: LockTime) -> Option<LockTime> {
	if !a.is_same_unit(b) {
		return None;
	}
	if a.to_consensus_u32() >= b.to_consensus_u32() {
		Some(a)
	} else {
		Some(b)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn max_locktime_same_unit() {
		let a = LockTime::from_height(800_000).unwrap();
		let b = LockTime::from_height(800_010).unwrap();
		assert_eq!(max_locktime(a, b), Some(b));
		assert_eq!(max_locktime(b, a), Some(b));
		assert_eq!(max_locktime(a, LockTime::ZERO), Some(a));

		let t = LockTime::from_time(1_700_000_000).unwrap();
		assert_eq!(max_locktime(a, t), None);
	}
}
