#[macro_use]
extern crate serde;

mod ballot;
mod clock;
mod commitment;
mod config;
mod error;
mod gate;
mod gossip;
mod issuer;
mod petition;
mod privacy;
mod relay;
mod reveal;
mod serde_hex;
mod store;
mod tally;
mod util;
mod vote;
pub mod voprf;
mod witness;

pub use ballot::*;
pub use clock::*;
pub use commitment::*;
pub use config::*;
pub use error::*;
pub use gate::*;
pub use gossip::*;
pub use issuer::*;
pub use petition::*;
pub use privacy::*;
pub use relay::*;
pub use reveal::*;
pub use serde_hex::*;
pub use store::*;
pub use tally::*;
pub use util::*;
pub use vote::*;
pub use voprf::{BlindState, CryptoError};
pub use witness::*;
