pub mod areas;
pub mod derivation;
pub mod grib;
pub mod met;
pub mod poller;
pub mod product;
pub mod profile;
