pub mod command;
pub mod singleflight;
