
use std::borrow::Borrow;

use cbitcoin::{Amount, FeeRate, OutPoint, Transaction};


/// Extension trait for [Transaction].
pub trait TransactionExt: Borrow<Transaction> {
	/// Returns total output value of the transaction.
	fn output_value(&self) -> Amount {
		self.borrow().output.iter().map(|o| o.value).sum()
	}

	/// Returns an iterator over the outpoints spent by this tx.
	fn spent_outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
		self.borrow().input.iter().map(|i| i.previous_output)
	}
}
impl TransactionExt for Transaction {}


/// Extension trait for [FeeRate].
pub trait FeeRateExt: Borrow<FeeRate> {
	/// Create a fee rate from an amount per kvB, rounding up.
	///
	/// This is the unit used by bitcoind's `estimatesmartfee`.
	fn from_amount_per_kvb_ceil(amount_kvb: Amount) -> FeeRate {
		FeeRate::from_sat_per_kvb_ceil(amount_kvb.to_sat())
	}

	/// Create a fee rate from sats per kvB, rounding up.
	fn from_sat_per_kvb_ceil(sat_kvb: u64) -> FeeRate {
		FeeRate::from_sat_per_kwu((sat_kvb + 3) / 4)
	}

	/// Convert into sats per kvB, rounding up.
	fn to_sat_per_kvb(&self) -> u64 {
		self.borrow().to_sat_per_kwu() * 4
	}

	/// Multiply the fee rate by `percent` percent, rounding up.
	fn scale_percent_ceil(&self, percent: u64) -> FeeRate {
		let kwu = self.borrow().to_sat_per_kwu();
		FeeRate::from_sat_per_kwu((kwu.saturating_mul(percent) + 99) / 100)
	}
}
impl FeeRateExt for FeeRate {}


#[cfg(test)]
mod test {
	use super::*;

	use cbitcoin::Weight;

	#[test]
	fn fee_rate_from_amount_per_kvb() {
		assert_eq!(FeeRate::from_amount_per_kvb_ceil(Amount::from_sat(1_000)),
			FeeRate::from_sat_per_vb_unchecked(1),
		);
		assert_eq!(FeeRate::from_amount_per_kvb_ceil(Amount::from_sat(7_372)),
			FeeRate::from_sat_per_kwu(1_843),
		);
		// 238 sat/kvB is 59.5 sat/kwu
		assert_eq!(FeeRate::from_amount_per_kvb_ceil(Amount::from_sat(238)),
			FeeRate::from_sat_per_kwu(60),
		);
	}

	#[test]
	fn fee_rate_to_sat_per_kvb() {
		let fr = FeeRate::from_sat_per_vb_unchecked(12);
		assert_eq!(fr.to_sat_per_kvb(), 12_000);
		assert_eq!(FeeRate::from_sat_per_kvb_ceil(fr.to_sat_per_kvb()), fr);
		assert_eq!(fr.fee_wu(Weight::from_vb_unchecked(1_000)), Some(Amount::from_sat(12_000)));
	}

	#[test]
	fn fee_rate_scale_percent() {
		let fr = FeeRate::from_sat_per_kwu(1_000);
		assert_eq!(fr.scale_percent_ceil(125), FeeRate::from_sat_per_kwu(1_250));
		assert_eq!(fr.scale_percent_ceil(100), fr);
		assert_eq!(FeeRate::from_sat_per_kwu(3).scale_percent_ceil(150), FeeRate::from_sat_per_kwu(5));
	}
}
