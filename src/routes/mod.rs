pub mod cache;
pub mod health;
pub mod poller;
pub mod profiles;
