//! Reactive primitives for Alder.
//!
//! Alder's reactivity is built from three primitives wired together by a
//! dependency graph that is discovered automatically through reads:
//!
//! * [`create_signal`] — a mutable reactive cell.
//! * [`create_memo`] — a lazily evaluated cell derived from other cells,
//!   recomputed only when one of its dependencies actually changed value.
//! * [`create_effect`] — a side effect re-run whenever any cell it read has
//!   changed, at most once per change epoch.
//!
//! Writes can be grouped with [`batch`], and reads exempted from tracking
//! with [`untrack`].
//!
//! # Example
//!
//! ```
//! use alder_reactive::*;
//!
//! let data = create_signal(0);
//! let doubled = create_memo(move || data.get() * 2);
//! create_effect(move || {
//!     println!("data value changed. new value = {data}, doubled value = {doubled}");
//! });
//! data.set(1);
//! data.set(2);
//! ```

#![warn(missing_docs)]

mod effect;
mod error;
mod graph;
mod memo;
mod node;
mod root;
mod signal;
mod utils;

pub use effect::*;
pub use error::ReactiveError;
pub use memo::*;
pub use root::{batch, untrack};
pub use signal::*;
pub use utils::*;
