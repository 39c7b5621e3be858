//! Fee directives, fee bucketing and the replacement policy.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use bitcoin::{Address, Amount, FeeRate, Weight};

use bitcoin_ext::{FeeRateExt, TxWeightEstimator};
use swap::fee::{fee_for_weight, sweep_tx_weight};

use crate::chain::WalletOracle;
use crate::config::Config;


/// How urgently a request wants to be swept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeePreference {
	/// Confirm within this many blocks, at the rate the wallet estimates.
	ConfTarget(u16),
	/// An explicit fee rate.
	#[serde(with = "crate::serde_util::fee_rate")]
	FeeRate(FeeRate),
}

impl fmt::Display for FeePreference {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			FeePreference::ConfTarget(t) => write!(f, "conf_target={}", t),
			FeePreference::FeeRate(r) => write!(f, "fee_rate={}", r),
		}
	}
}

/// Resolve the fee preference into a fee rate.
///
/// Conf targets are estimated by the wallet. When the wallet fails or
/// doesn't answer in time, the configured fallback rate is used.
pub async fn resolve_fee_rate(
	wallet: &dyn WalletOracle,
	preference: FeePreference,
	call_timeout: Duration,
	fallback: FeeRate,
) -> FeeRate {
	let conf_target = match preference {
		FeePreference::FeeRate(r) => return r,
		FeePreference::ConfTarget(t) => t,
	};

	let res = tokio::time::timeout(call_timeout, wallet.estimate_fee_rate(conf_target)).await
		.context("fee estimation timed out")
		.and_then(|r| r);
	match res {
		Ok(rate) => rate,
		Err(e) => {
			slog!(FeeEstimateFallback, conf_target, fallback, err: format!("{:#}", e));
			fallback
		},
	}
}

/// The index of the fee bucket a fee rate falls in.
///
/// Buckets are `bucket_size` wide and an exact multiple of the size is
/// the upper end of its bucket.
pub fn fee_bucket(fee_rate: FeeRate, bucket_size: FeeRate) -> u64 {
	let size = bucket_size.to_sat_per_kwu().max(1);
	(fee_rate.to_sat_per_kwu() + size - 1) / size
}

/// The fee rate of the replacement of a transaction with the given rate.
///
/// Always strictly higher than `fee_rate`, unless the maximum is reached.
pub fn bump_fee_rate(fee_rate: FeeRate, cfg: &Config) -> FeeRate {
	let scaled = fee_rate.scale_percent_ceil(100 + cfg.fee_bump_percent);
	let min_bump = FeeRate::from_sat_per_kwu(
		fee_rate.to_sat_per_kwu().saturating_add(cfg.min_fee_bump.to_sat_per_kwu()),
	);
	let mut bumped = scaled.max(min_bump);
	if bumped == fee_rate {
		bumped = FeeRate::from_sat_per_kwu(fee_rate.to_sat_per_kwu() + 1);
	}
	bumped.min(cfg.max_fee_rate)
}

/// Number of blocks to wait for a confirmation after the given attempt.
///
/// Starts at the base delta and doubles with each attempt, up to the max.
pub fn retry_delta(attempt: usize, cfg: &Config) -> u32 {
	let shift = attempt.saturating_sub(1).min(31) as u32;
	let delta = (cfg.retry_base_delta_blocks as u64) << shift;
	delta.min(cfg.retry_max_delta_blocks as u64) as u32
}

/// Quote the fee of sweeping to `dest` at the wallet's fee rate for
/// `conf_target`.
///
/// `add_input` adds the inputs to sweep to the weight estimator.
pub async fn get_sweep_fee(
	wallet: &dyn WalletOracle,
	add_input: impl FnOnce(&mut TxWeightEstimator),
	conf_target: u16,
	dest: &Address,
) -> anyhow::Result<(Amount, Weight)> {
	let fee_rate = wallet.estimate_fee_rate(conf_target).await
		.with_context(|| format!("error estimating fee rate for conf target {}", conf_target))?;
	let weight = sweep_tx_weight(dest, add_input)?;
	Ok((fee_for_weight(fee_rate, weight), weight))
}
