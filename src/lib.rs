//! ForgePool: a mining-pool stratum server.
//!
//! Miners connect over TCP and speak either getwork/EthProxy (`eth_*`) or
//! EthereumStratum/1.0.0 (`mining.*`). The pool pulls work from a chain node,
//! keeps per-epoch verification datasets, validates shares, retargets each
//! miner's difficulty and forwards solutions back to the node.

pub mod config;
pub mod core;
pub mod epoch;
pub mod error;
pub mod events;
pub mod jobs;
pub mod pool;
pub mod pow;
pub mod session;
pub mod share;
pub mod stratum;
pub mod upstream;
pub mod vardiff;
