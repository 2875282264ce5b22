pub mod handler;
pub mod hub;
pub mod presence;

pub use hub::ChatHub;
