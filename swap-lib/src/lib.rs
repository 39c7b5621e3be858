
pub extern crate bitcoin;

#[macro_use] extern crate serde;
#[macro_use] extern crate lazy_static;

#[macro_use]
pub mod util;

pub mod fee;
pub mod htlc;
pub mod lightning;
pub mod witness;

pub use crate::htlc::{Htlc, OutputType, UnsupportedEncoding};
pub use crate::lightning::{PaymentHash, Preimage};
pub use crate::witness::{HtlcSpendType, PreimageMismatch, SweepWitness};
