//! A [WalletOracle] backed by the bitcoind wallet.

use std::sync::Arc;

use anyhow::Context;
use bdk_bitcoind_rpc::bitcoincore_rpc::{self as rpc, jsonrpc, Auth, Client, RpcApi};
use bitcoin::{Address, FeeRate, Network, Transaction};

use bitcoin_ext::FeeRateExt;

use crate::chain::WalletOracle;
use crate::config::Config;


/// Error code for RPC_VERIFY_ALREADY_IN_UTXO_SET.
const RPC_VERIFY_ALREADY_IN_UTXO_SET: i32 = -27;

trait RpcErrorExt {
	/// Whether the tx we sent is already confirmed.
	fn is_in_utxo_set(&self) -> bool;
	fn is_already_in_mempool(&self) -> bool;
}

impl RpcErrorExt for rpc::Error {
	fn is_in_utxo_set(&self) -> bool {
		if let rpc::Error::JsonRpc(jsonrpc::Error::Rpc(e)) = self {
			e.code == RPC_VERIFY_ALREADY_IN_UTXO_SET
		} else {
			false
		}
	}

	fn is_already_in_mempool(&self) -> bool {
		if let rpc::Error::JsonRpc(jsonrpc::Error::Rpc(e)) = self {
			e.message.contains("txn-already-in-mempool")
		} else {
			false
		}
	}
}

pub struct BitcoindOracle {
	client: Arc<Client>,
	network: Network,
}

impl BitcoindOracle {
	pub fn new(url: &str, auth: Auth, network: Network) -> anyhow::Result<BitcoindOracle> {
		let client = Client::new(url, auth)
			.with_context(|| format!("failed to create bitcoind rpc client for {}", url))?;
		Ok(BitcoindOracle { client: Arc::new(client), network })
	}

	pub fn from_config(cfg: &Config) -> anyhow::Result<BitcoindOracle> {
		BitcoindOracle::new(&cfg.bitcoind.url, cfg.bitcoind.auth()?, cfg.network)
	}

	/// Run a blocking rpc call off the async runtime.
	async fn call<T, F>(&self, f: F) -> anyhow::Result<T>
	where
		T: Send + 'static,
		F: FnOnce(&Client) -> anyhow::Result<T> + Send + 'static,
	{
		let client = self.client.clone();
		tokio::task::spawn_blocking(move || f(&client)).await
			.context("bitcoind rpc task panicked")?
	}
}

#[async_trait]
impl WalletOracle for BitcoindOracle {
	async fn estimate_fee_rate(&self, conf_target: u16) -> anyhow::Result<FeeRate> {
		self.call(move |c| {
			let fee = c.estimate_smart_fee(conf_target, Some(rpc::json::EstimateMode::Conservative))
				.context("estimatesmartfee failed")?;
			match fee.fee_rate {
				Some(fee_rate) => Ok(FeeRate::from_amount_per_kvb_ceil(fee_rate)),
				None => bail!(
					"No rate returned from estimate_smart_fee for a {} confirmation target",
					conf_target,
				),
			}
		}).await
	}

	async fn next_address(&self) -> anyhow::Result<Address> {
		let network = self.network;
		self.call(move |c| {
			let addr = c.get_new_address(None, Some(rpc::json::AddressType::Bech32))
				.context("getnewaddress failed")?;
			addr.require_network(network)
				.context("bitcoind returned an address for the wrong network")
		}).await
	}

	async fn publish_transaction(&self, tx: &Transaction) -> anyhow::Result<()> {
		let tx = tx.clone();
		self.call(move |c| {
			match c.send_raw_transaction(&tx) {
				Ok(_) => Ok(()),
				Err(e) if e.is_in_utxo_set() || e.is_already_in_mempool() => {
					trace!("Tx {} already known to bitcoind", tx.compute_txid());
					Ok(())
				},
				Err(e) => Err(e).with_context(|| format!("failed to broadcast tx {}", tx.compute_txid())),
			}
		}).await
	}
}
