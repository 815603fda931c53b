pub mod balance;
pub mod broadcaster;
pub mod config;
pub mod device;
pub mod enumerator;
pub mod error;
pub mod native_ledger;
pub mod operation_log;
pub mod rpc;
pub mod signer;
pub mod tx_builder;
pub mod types;
pub mod utils;
pub mod wallet_service;

#[cfg(test)]
mod test_support;
