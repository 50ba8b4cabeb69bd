// Tip settlement crate
//
// Every chat user gets an account derived from one master seed. The
// settlement engine moves funds between those accounts and the outside
// world, and turns ledger confirmations into tip, withdrawal and top-up
// events.

pub mod api;
pub mod config;
pub mod notify;
pub mod settlement;
