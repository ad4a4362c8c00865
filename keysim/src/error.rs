//! Errors from driving the simulator with inconsistent arguments.

use keyroute::Address;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("no node with address {0}")]
    UnknownNode(Address),

    #[error("{from} has no connection to {to}")]
    NotConnected { from: Address, to: Address },
}
