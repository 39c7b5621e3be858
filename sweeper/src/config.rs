
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use bdk_bitcoind_rpc::bitcoincore_rpc::Auth;
use bitcoin::FeeRate;
use config::{Environment, File};

use crate::serde_util;


#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Bitcoind {
	/// the URL of the bitcoind RPC
	pub url: String,
	/// the path of the cookie file for the bitcoind RPC
	///
	/// Use either this or [Bitcoind::rpc_user] and [Bitcoind::rpc_pass].
	pub cookie: Option<PathBuf>,
	pub rpc_user: Option<String>,
	pub rpc_pass: Option<String>,
}

impl Bitcoind {
	/// The configured authentication method.
	pub fn auth(&self) -> anyhow::Result<Auth> {
		match (&self.rpc_user, &self.rpc_pass, &self.cookie) {
			(Some(user), Some(pass), None) => Ok(Auth::UserPass(user.into(), pass.into())),
			(None, None, Some(cookie)) => Ok(Auth::CookieFile(cookie.into())),
			(Some(_), None, _) => bail!("Missing configuration bitcoind.rpc_pass. \
				This is required if bitcoind.rpc_user is provided"),
			(None, Some(_), _) => bail!("Missing configuration bitcoind.rpc_user. \
				This is required if bitcoind.rpc_pass is provided"),
			(Some(_), Some(_), Some(_)) => bail!("Invalid configuration for authentication \
				to bitcoind. Use either bitcoind.cookie or (bitcoind.rpc_user and \
				bitcoind.rpc_pass) but not both."),
			(None, None, None) => bail!("Configuring authentication to bitcoind is mandatory. \
				Specify either bitcoind.cookie or (bitcoind.rpc_user and bitcoind.rpc_pass)."),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	pub network: bitcoin::Network,
	/// Path of the sqlite database holding sweep state.
	pub db_path: PathBuf,

	/// Confirmation target used when quoting sweep fees.
	pub conf_target: u16,
	/// Time pending requests wait for others to join their batch.
	#[serde(with = "serde_util::duration")]
	pub batch_window: Duration,
	/// Pending requests are flushed immediately once this many are waiting.
	pub max_inputs_per_tx: usize,
	/// Number of transactions we try per batch before giving up.
	pub max_sweep_attempts: usize,
	/// Blocks to wait for confirmation after the first publish.
	///
	/// Doubles with every attempt up to [Config::retry_max_delta_blocks].
	pub retry_base_delta_blocks: u32,
	pub retry_max_delta_blocks: u32,

	/// Percentage by which the fee rate grows on every replacement.
	pub fee_bump_percent: u64,
	/// Minimum absolute fee rate increase on every replacement.
	#[serde(with = "serde_util::fee_rate")]
	pub min_fee_bump: FeeRate,
	#[serde(with = "serde_util::fee_rate")]
	pub max_fee_rate: FeeRate,
	/// Width of the fee rate buckets used to group requests.
	#[serde(with = "serde_util::fee_rate")]
	pub fee_rate_bucket_size: FeeRate,
	/// Fee rate used when the fee oracle fails.
	#[serde(with = "serde_util::fee_rate")]
	pub fallback_fee_rate: FeeRate,

	/// Deadline for every call to the signer, wallet or notifier.
	#[serde(with = "serde_util::duration")]
	pub call_timeout: Duration,
	/// Confirmations a sweep needs before the request is resolved.
	pub confirmation_depth: u32,
	/// Number of submissions that can be queued for the control task.
	pub request_queue_size: usize,

	pub bitcoind: Bitcoind,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			network: bitcoin::Network::Regtest,
			db_path: "./sweeper.sqlite".into(),

			conf_target: 6,
			batch_window: Duration::from_secs(30),
			max_inputs_per_tx: 100,
			max_sweep_attempts: 10,
			retry_base_delta_blocks: 1,
			retry_max_delta_blocks: 32,

			fee_bump_percent: 25,
			min_fee_bump: FeeRate::from_sat_per_vb_unchecked(1),
			max_fee_rate: FeeRate::from_sat_per_vb_unchecked(1_000),
			fee_rate_bucket_size: FeeRate::from_sat_per_vb_unchecked(10),
			fallback_fee_rate: FeeRate::from_sat_per_vb_unchecked(10),

			call_timeout: Duration::from_secs(30),
			confirmation_depth: 1,
			request_queue_size: 100,

			bitcoind: Bitcoind {
				url: "http://127.0.0.1:18443".into(),
				cookie: None,
				rpc_user: None,
				rpc_pass: None,
			},
		}
	}
}

impl Config {
	fn load_with_custom_env(
		config_file: Option<&Path>,
		custom_env: Option<std::collections::HashMap<String, String>>,
	) -> anyhow::Result<Self> {
		let default = config::Config::try_from(&Self::default())
			.context("default config failed to deconstruct")?;

		// We'll add three layers of config:
		// - the defaults defined in Config's Default impl
		// - the config file passed in this function, if any
		// - environment variables (prefixed with `SWEEPER__`)

		let mut builder = config::Config::builder()
			.add_source(default);
		if let Some(file) = config_file {
			builder = builder.add_source(File::from(file));
		}

		let env = Environment::with_prefix("SWEEPER")
			.separator("__")
			.source(custom_env);
		builder = builder.add_source(env);

		let cfg = builder.build().context("error building config")?;
		Ok(cfg.try_deserialize().context("error parsing config")?)
	}

	pub fn load(config_file: Option<&Path>) -> anyhow::Result<Self> {
		Self::load_with_custom_env(config_file, None)
	}

	/// Verifies if the specified configuration is valid.
	pub fn validate(&self) -> anyhow::Result<()> {
		if self.max_inputs_per_tx == 0 {
			bail!("max_inputs_per_tx must be at least 1");
		}
		if self.max_sweep_attempts == 0 {
			bail!("max_sweep_attempts must be at least 1");
		}
		if self.confirmation_depth == 0 {
			bail!("confirmation_depth must be at least 1");
		}
		if self.request_queue_size == 0 {
			bail!("request_queue_size must be at least 1");
		}
		if self.fee_rate_bucket_size == FeeRate::ZERO {
			bail!("fee_rate_bucket_size can't be zero");
		}
		if self.retry_base_delta_blocks == 0
			|| self.retry_base_delta_blocks > self.retry_max_delta_blocks
		{
			bail!("retry_base_delta_blocks must be between 1 and retry_max_delta_blocks");
		}
		if self.fallback_fee_rate > self.max_fee_rate {
			bail!("fallback_fee_rate {} exceeds max_fee_rate {}",
				self.fallback_fee_rate, self.max_fee_rate,
			);
		}
		if self.fee_bump_percent == 0 && self.min_fee_bump == FeeRate::ZERO {
			bail!("fee bumps must increase the fee rate: \
				set either fee_bump_percent or min_fee_bump");
		}
		Ok(())
	}

	/// Write the config into the writer.
	pub fn write_into(&self, writer: &mut dyn io::Write) -> anyhow::Result<()> {
		let s = toml::to_string_pretty(self).context("config serialization error")?;
		writer.write_all(s.as_bytes()).context("error writing config to writer")?;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use std::collections::HashMap;
	use std::io::Write;

	use super::*;

	#[test]
	fn defaults_are_valid() {
		let cfg = Config::load(None).unwrap();
		cfg.validate().expect("default config should be valid");
		assert_eq!(cfg.call_timeout, Duration::from_secs(30));
		assert_eq!(cfg.batch_window, Duration::from_secs(30));
	}

	#[test]
	fn validate_sweeper_config() {
		let mut cfg = Config::default();
		cfg.max_inputs_per_tx = 0;
		cfg.validate().expect_err("no inputs per tx");

		let mut cfg = Config::default();
		cfg.retry_base_delta_blocks = 64;
		cfg.validate().expect_err("base delta above max");

		let mut cfg = Config::default();
		cfg.fallback_fee_rate = FeeRate::from_sat_per_vb_unchecked(2_000);
		cfg.validate().expect_err("fallback above max");

		let mut cfg = Config::default();
		cfg.fee_bump_percent = 0;
		cfg.validate().expect("min bump alone is fine");
		cfg.min_fee_bump = FeeRate::ZERO;
		cfg.validate().expect_err("no bump at all");
	}

	#[test]
	fn validate_bitcoind_auth() {
		let cookie = Some(PathBuf::from("/not/hot/dog/but/cookie"));
		let user = Some(String::from("erlich"));
		let pass = Some(String::from("belson"));

		let mut cfg = Config::default();
		cfg.bitcoind.cookie = cookie.clone();
		assert!(matches!(cfg.bitcoind.auth().unwrap(), Auth::CookieFile(_)));

		let mut cfg = Config::default();
		cfg.bitcoind.rpc_user = user.clone();
		cfg.bitcoind.rpc_pass = pass.clone();
		assert!(matches!(cfg.bitcoind.auth().unwrap(), Auth::UserPass(_, _)));

		let mut cfg = Config::default();
		cfg.bitcoind.auth().expect_err("auth info is missing");
		cfg.bitcoind.rpc_user = user.clone();
		cfg.bitcoind.auth().expect_err("pass is missing");
		cfg.bitcoind.rpc_pass = pass.clone();
		cfg.bitcoind.cookie = cookie.clone();
		cfg.bitcoind.auth().expect_err("either cookie or pass but not both");
	}

	#[test]
	fn config_from_env_vars() {
		let env = [
			("SWEEPER__MAX_INPUTS_PER_TX", "2"),
			("SWEEPER__BATCH_WINDOW", "5s"),
			("SWEEPER__MAX_FEE_RATE", "200sat/vb"),
			("SWEEPER__BITCOIND__COOKIE", "/not/hot/dog/but/cookie"),
		].into_iter().map(|(k, v)| (k.into(), v.into())).collect::<HashMap<String, String>>();

		let cfg = Config::load_with_custom_env(None, Some(env)).unwrap();
		cfg.validate().expect("invalid configuration");

		assert_eq!(cfg.max_inputs_per_tx, 2);
		assert_eq!(cfg.batch_window, Duration::from_secs(5));
		assert_eq!(cfg.max_fee_rate, FeeRate::from_sat_per_vb_unchecked(200));
		assert_eq!(cfg.bitcoind.cookie, Some("/not/hot/dog/but/cookie".into()));
		// untouched values keep their default
		assert_eq!(cfg.conf_target, 6);
	}

	#[test]
	fn config_file_roundtrip() {
		let mut cfg = Config::default();
		cfg.confirmation_depth = 3;
		cfg.call_timeout = Duration::from_secs(10);

		let path = std::env::temp_dir()
			.join(format!("sweeper-config-{}.toml", rand::random::<u64>()));
		let mut file = std::fs::File::create(&path).unwrap();
		cfg.write_into(&mut file).unwrap();
		file.flush().unwrap();

		let loaded = Config::load(Some(&path)).unwrap();
		assert_eq!(loaded.confirmation_depth, 3);
		assert_eq!(loaded.call_timeout, Duration::from_secs(10));
		assert_eq!(loaded.fee_rate_bucket_size, cfg.fee_rate_bucket_size);
		std::fs::remove_file(&path).unwrap();
	}
}
