//! Robot-side vocabulary.

pub mod command;
