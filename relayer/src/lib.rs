pub mod api;
pub mod cfg;
pub mod client;
pub mod contracts;
pub mod crypto;
pub mod driver;
pub mod evm;
pub mod heartbeat;
pub mod ledger;
pub mod message;
pub mod node;
pub mod p2p_node;
pub mod router;
pub mod transactor;
