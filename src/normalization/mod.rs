//! Pure string-shape intelligence: comparison keys, alias folding, unit codes.

pub mod identity;

pub use identity::{normalize_key, MatchConfig, MIN_TITLE_SIMILARITY};
