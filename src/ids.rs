//! Trace and span identifier generation.
//!
//! Identifiers are produced from a per-thread random number generator seeded
//! from OS entropy combined with a process-global monotonically increasing
//! offset, so that generators created concurrently never share a seed.

use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// A 128-bit trace identifier.
///
/// When 128-bit generation is disabled the upper half is zero and the
/// identifier behaves as a plain 64-bit id. The lower 64 bits are always
/// non-zero with the top bit clear so they can be serialized as a decimal
/// signed integer by peers that only understand 64-bit ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TraceId {
    upper: u64,
    lower: u64,
}

/// Returned when a hexadecimal id cannot be parsed.
#[derive(Debug, Error, PartialEq)]
#[error("malformed hexadecimal id")]
pub struct ParseIdError;

impl TraceId {
    /// The zero (invalid) trace id.
    pub const ZERO: TraceId = TraceId { upper: 0, lower: 0 };

    pub const fn new(upper: u64, lower: u64) -> Self {
        TraceId { upper, lower }
    }

    pub const fn from_u128(value: u128) -> Self {
        TraceId {
            upper: (value >> 64) as u64,
            lower: value as u64,
        }
    }

    pub const fn to_u128(self) -> u128 {
        (self.upper as u128) << 64 | self.lower as u128
    }

    /// The most significant 64 bits, zero unless 128-bit ids are enabled.
    pub const fn upper(self) -> u64 {
        self.upper
    }

    /// The least significant 64 bits.
    pub const fn lower(self) -> u64 {
        self.lower
    }

    pub const fn is_zero(self) -> bool {
        self.upper == 0 && self.lower == 0
    }

    /// Formats the full id as 32 lowercase hexadecimal characters.
    pub fn to_hex(self) -> String {
        format!("{:016x}{:016x}", self.upper, self.lower)
    }

    /// Parses up to 32 hexadecimal characters, right-aligned: a 16-character
    /// input populates only the lower half.
    pub fn from_hex(value: &str) -> Result<TraceId, ParseIdError> {
        if value.is_empty() || value.len() > 32 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseIdError);
        }
        if value.len() <= 16 {
            let lower = u64::from_str_radix(value, 16).map_err(|_| ParseIdError)?;
            Ok(TraceId { upper: 0, lower })
        } else {
            let (hi, lo) = value.split_at(value.len() - 16);
            let upper = u64::from_str_radix(hi, 16).map_err(|_| ParseIdError)?;
            let lower = u64::from_str_radix(lo, 16).map_err(|_| ParseIdError)?;
            Ok(TraceId { upper, lower })
        }
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self.to_hex())
    }
}

static SEED_OFFSET: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static GENERATOR: RefCell<SmallRng> = RefCell::new(seeded_generator());
}

fn seeded_generator() -> SmallRng {
    let offset = SEED_OFFSET.fetch_add(1, Ordering::Relaxed);
    SmallRng::seed_from_u64(rand::random::<u64>() ^ offset)
}

/// Returns a non-zero 64-bit id with the top bit clear.
pub(crate) fn new_span_id() -> u64 {
    GENERATOR.with(|rng| {
        let mut rng = rng.borrow_mut();
        loop {
            let id = rng.random::<u64>() >> 1;
            if id != 0 {
                return id;
            }
        }
    })
}

/// Returns a fresh trace id. With 128-bit generation enabled the upper half
/// carries the Unix time in seconds shifted into its high 32 bits; otherwise
/// it is zero.
pub(crate) fn new_trace_id(now_ns: i64, with_128_bits: bool) -> TraceId {
    let upper = if with_128_bits {
        ((now_ns / 1_000_000_000) as u64) << 32
    } else {
        0
    };
    TraceId {
        upper,
        lower: new_span_id(),
    }
}
