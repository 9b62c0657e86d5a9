// crates/redline-media/src/helpers/mod.rs
//
// Internal helper modules for redline-media. Not re-exported from lib.rs.

pub mod redact;
