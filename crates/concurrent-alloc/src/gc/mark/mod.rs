//! Marking bitmaps used for black-area bookkeeping.

pub mod bitmap;

pub use bitmap::MarkBitmap;
