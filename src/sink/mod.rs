// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document store seam.
//!
//! The engine produces [`DocumentOp`]s; a [`DocumentSink`] applies them in
//! bulk. Operations are buffered per mapping by
//! [`BulkBuffer`](crate::batching::BulkBuffer).

mod memory;
mod traits;

pub use memory::{MemorySink, StoredDocument};
pub use traits::{
    loosely_equal, match_value, CommitOutcome, DocumentOp, DocumentSink, FailureKind, OpFailure, SinkError,
    ID_MATCH_KEY,
};
pub(crate) use traits::scalar_text;
