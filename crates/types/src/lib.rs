pub mod accounts;
pub mod calendar;
pub mod data;
pub mod error;
pub mod keys;
pub mod symbols;
pub mod trade;
pub mod wire;
