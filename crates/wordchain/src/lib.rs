pub mod dict;
pub mod engine;
pub mod records;
pub mod rules;
pub mod session;
pub mod sync;
