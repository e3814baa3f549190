use tracing::{debug, warn};

use crate::element::TmaElement;

/// Element-wise comparison of a copy's destination against its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    pub good: usize,
    pub bad: usize,
    /// Flat index of the first mismatching element.
    pub first_mismatch: Option<usize>,
}

impl Verification {
    pub fn is_success(&self) -> bool {
        self.bad == 0
    }
}

const MAX_REPORTED: usize = 10;

pub fn verify_copy<E: TmaElement>(expected: &[E], actual: &[E]) -> Verification {
    assert_eq!(expected.len(), actual.len(), "source and destination differ in length");

    let mut good = 0;
    let mut bad = 0;
    let mut first_mismatch = None;
    for (i, (e, a)) in expected.iter().zip(actual).enumerate() {
        if e == a {
            good += 1;
            continue;
        }
        if bad < MAX_REPORTED {
            warn!(index = i, expected = ?e, actual = ?a, "copy mismatch");
        }
        first_mismatch.get_or_insert(i);
        bad += 1;
    }
    if bad > MAX_REPORTED {
        warn!(suppressed = bad - MAX_REPORTED, "further mismatches not shown");
    }
    debug!(good, bad, "verification done");

    Verification {
        good,
        bad,
        first_mismatch,
    }
}
