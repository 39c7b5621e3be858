//! Weight and fee accounting for sweep transactions.

use bitcoin::{Address, AddressType, Amount, FeeRate, Weight};

use bitcoin_ext::TxWeightEstimator;


/// We only know the weight of a few standard output types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported sweep destination address type: {address}")]
pub struct UnsupportedAddressType {
	pub address: String,
}

/// Add an output paying to `dest` to the estimator.
pub fn add_output_estimate(
	est: &mut TxWeightEstimator,
	dest: &Address,
) -> Result<(), UnsupportedAddressType> {
	match dest.address_type() {
		Some(AddressType::P2wsh) => est.add_p2wsh_output(),
		Some(AddressType::P2wpkh) => est.add_p2wkh_output(),
		Some(AddressType::P2sh) => est.add_p2sh_output(),
		Some(AddressType::P2pkh) => est.add_p2pkh_output(),
		_ => return Err(UnsupportedAddressType { address: dest.to_string() }),
	};
	Ok(())
}

/// The weight of a transaction with the inputs added by `add_inputs` and
/// a single output to `dest`.
pub fn sweep_tx_weight(
	dest: &Address,
	add_inputs: impl FnOnce(&mut TxWeightEstimator),
) -> Result<Weight, UnsupportedAddressType> {
	let mut est = TxWeightEstimator::new();
	add_output_estimate(&mut est, dest)?;
	add_inputs(&mut est);
	Ok(est.weight())
}

/// The fee to pay for the given weight at the given fee rate, rounding up.
pub fn fee_for_weight(fee_rate: FeeRate, weight: Weight) -> Amount {
	let sat = (fee_rate.to_sat_per_kwu() * weight.to_wu() + 999) / 1000;
	Amount::from_sat(sat)
}
