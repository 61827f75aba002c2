#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Persistent index layer of the calder chain state engine.
//!
//! Typed, ordered keyed stores over an embedded key-value engine (`sled`).
//! Tables are declared as unit types implementing [`Table`]; an
//! [`IndexStore`] is the handle the engine reads and writes through. Keys use
//! a byte-order-preserving encoding so the engine's lexicographic iteration
//! equals the logical key order, and every store supports a deferred-flush
//! mode (`set_write_through(false)`) used while reindexing.

mod error;
pub use error::DatabaseError;

mod table;
pub use table::{KeyEncode, Table};

mod store;
pub use store::{IndexStore, StoreIter};

mod env;
pub use env::StoreEnv;

pub mod tables;
