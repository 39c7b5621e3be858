
#[macro_use] extern crate anyhow;
#[macro_use] extern crate async_trait;
#[macro_use] extern crate log;
#[macro_use] extern crate serde;
#[macro_use] extern crate sweeper_log;

pub extern crate swap;

pub mod batch;
pub mod bitcoind;
pub mod chain;
pub mod config;
pub mod error;
pub mod fees;
pub mod persist;
pub mod serde_util;
pub mod signer;
pub mod sweeper;
pub mod system;

#[cfg(test)]
mod test_util;

pub use crate::batch::SweepInput;
pub use crate::bitcoind::BitcoindOracle;
pub use crate::chain::{ChainNotifier, SignDescriptor, Signer, WalletOracle};
pub use crate::config::Config;
pub use crate::error::SweepError;
pub use crate::fees::{get_sweep_fee, FeePreference};
pub use crate::persist::{MemoryStore, SqliteStore, SweepRecord, SweepState, SweepStore};
pub use crate::signer::KeypairSigner;
pub use crate::sweeper::{SweepReceiver, SweepRequest, SweepResult, Sweeper};
pub use crate::system::RuntimeManager;
