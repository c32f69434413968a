pub mod loop_controller;
pub mod pipeline;
pub mod position_aggregator;
pub mod position_manager;
pub mod safety;
pub mod unwind_controller;
