//! Tests for query filters.

mod vectors;
