pub mod change;
pub mod errors;
pub mod ids;
pub mod notify;
pub mod position;
