//! Tests for transports.
