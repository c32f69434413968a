pub mod action;
pub mod health;
pub mod market;
pub mod position;
pub mod session;
pub mod settlement;

pub use action::*;
pub use health::*;
pub use market::*;
pub use position::*;
pub use session::*;
pub use settlement::*;
