pub mod composer;
pub mod ledger;
pub mod market_client;
pub mod normalize;
pub mod settlement;
pub mod simulated;
pub mod wallet;
