// Copyright 2024 xtree-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io;

/// Errors surfaced at the index boundary
#[derive(Debug)]
pub enum Error {
    /// A read, write, or seek against the page file failed
    Io(io::Error),
    /// The page file does not deserialize to a consistent tree
    CorruptFile(String),
    /// A geometric computation left the finite float range
    NumericOverflow,
    /// A serialized node does not fit its on-disk budget
    CapacityExceeded {
        page_id: u32,
        needed: usize,
        budget: usize,
    },
    /// Rejected configuration, reported at construction
    ConfigInvalid(String),
    /// Operation the index does not implement
    NotSupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error. {}", e),
            Error::CorruptFile(msg) => write!(f, "Corrupt page file. {}", msg),
            Error::NumericOverflow => write!(f, "Numeric overflow in geometry computation."),
            Error::CapacityExceeded {
                page_id,
                needed,
                budget,
            } => write!(
                f,
                "Page {} needs {} bytes but its budget is {}.",
                page_id, needed, budget
            ),
            Error::ConfigInvalid(msg) => write!(f, "Invalid configuration. {}", msg),
            Error::NotSupported(op) => write!(f, "Operation not supported: {}.", op),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}
