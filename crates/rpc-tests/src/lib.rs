//! Integration tests for the RPC framework: a real `rpc-server` `Server`
//! talking to a real `rpc-client` `ClientSession` over loopback TCP.

pub mod harness;

#[cfg(test)]
mod echo_tests;
#[cfg(test)]
mod timeout_tests;
#[cfg(test)]
mod async_handler_tests;
#[cfg(test)]
mod unknown_method_tests;
#[cfg(test)]
mod pubsub_tests;
#[cfg(test)]
mod reconnect_tests;
