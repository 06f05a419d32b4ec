//! Shared `proptest` payload generators for exercising the wire codec and
//! pipe flow control with realistic, variably-sized byte strings instead of
//! a handful of hand-picked fixtures.

use bytes::Bytes;
use proptest::collection::size_range;
use proptest::prelude::*;

/// A `Vec<u8>` wrapper with a `Debug` impl that doesn't dump megabytes of
/// hex into a failed-proptest report.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload(pub Vec<u8>);

impl core::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} bytes: 0x", self.0.len())?;
        for byte in self.0.iter().take(16) {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > 16 {
            write!(f, "..")?;
        }
        Ok(())
    }
}

impl From<Payload> for Bytes {
    fn from(payload: Payload) -> Self {
        Bytes::from(payload.0)
    }
}

/// Small-ish payloads: individual command bodies, a handful of pipe chunks.
const SMALL_MIN: usize = 0;
const SMALL_MAX: usize = 4096;

prop_compose! {
    pub fn payload()(data in any_with::<Vec<u8>>(size_range(SMALL_MIN..SMALL_MAX).lift())) -> Payload {
        Payload(data)
    }
}

/// Payloads that span many chunked-framing segments (32767 bytes max per
/// chunk) or exercise the pipe window across several round-trips.
const LARGE_MIN: usize = 64 * 1024;
const LARGE_MAX: usize = 512 * 1024;

prop_compose! {
    pub fn large_payload()(data in any_with::<Vec<u8>>(size_range(LARGE_MIN..LARGE_MAX).lift())) -> Payload {
        Payload(data)
    }
}
