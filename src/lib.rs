#![forbid(unsafe_code)]
pub mod cfg;
pub mod hir;
pub mod int128;
pub mod layout;
pub mod target;
