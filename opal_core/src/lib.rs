//! Opal Core Types
//!
//! The value representation and heap-object headers shared by every
//! component of the Opal execution engine: the interpreter, the compiled
//! backend, the garbage collector, and the fiber/stack subsystem.
//!
//! # Representation
//!
//! An Opal [`Value`] is one machine word. The low bit distinguishes
//! immediate integers (bit set) from block pointers (bit clear, word
//! aligned). Every heap or arena block is preceded by a one-word
//! [`Header`] carrying its tag, collector color, and size in words.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod header;
mod value;

pub use header::{Color, Header, NO_SCAN_TAG, TAG_BOUNDARY, TAG_INTERIOR, TAG_PAIR};
pub use value::Value;

/// Size of one machine word in bytes.
pub const WORD: usize = std::mem::size_of::<usize>();
