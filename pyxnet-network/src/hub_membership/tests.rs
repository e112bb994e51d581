//! Tests for hub membership.

mod vectors;
