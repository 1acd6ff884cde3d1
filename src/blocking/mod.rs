//! Blocking Detector (spec.md §4.4).

mod detector;

pub use detector::{classify, BlockTable, Classification, RawResponse};
