//! NLU payload parsing
//!
//! The engine only sees [`sdk::ParsedData`]. Parsers in this module turn a
//! vendor payload into it.

pub mod wit;

pub use wit::WitParser;
