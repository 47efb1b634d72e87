//! Block heights.

use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// The height of a block is the length of the chain back to the genesis
/// block.
///
/// # Invariants
///
/// Users should not construct block heights greater than [`Height::MAX`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Height(pub u64);

/// A signed difference between two [`Height`]s.
pub type HeightDiff = i64;

impl Height {
    /// The minimum Height.
    pub const MIN: Height = Height(0);

    /// The maximum Height.
    ///
    /// Bounded so that any difference between two valid heights fits in a
    /// [`HeightDiff`].
    pub const MAX: Height = Height(i64::MAX as u64 - 1);
}

impl Sub<Height> for Height {
    type Output = HeightDiff;

    fn sub(self, rhs: Height) -> HeightDiff {
        self.0 as HeightDiff - rhs.0 as HeightDiff
    }
}

impl Add<HeightDiff> for Height {
    type Output = Option<Height>;

    fn add(self, rhs: HeightDiff) -> Option<Height> {
        let result = (self.0 as HeightDiff).checked_add(rhs)?;
        match u64::try_from(result) {
            Ok(h) if Height(h) <= Height::MAX => Some(Height(h)),
            _ => None,
        }
    }
}

impl Sub<HeightDiff> for Height {
    type Output = Option<Height>;

    fn sub(self, rhs: HeightDiff) -> Option<Height> {
        self + rhs.checked_neg()?
    }
}

#[cfg(any(test, feature = "proptest-impl"))]
use proptest::prelude::*;

#[cfg(any(test, feature = "proptest-impl"))]
impl Arbitrary for Height {
    type Parameters = ();

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        (Height::MIN.0..=Height::MAX.0).prop_map(Height).boxed()
    }

    type Strategy = BoxedStrategy<Self>;
}

#[test]
fn operator_tests() {
    assert_eq!(Some(Height(2)), Height(1) + 1);
    assert_eq!(None, Height::MAX + 1);

    assert_eq!(Some(Height(1)), Height(2) - 1);
    assert_eq!(None, Height(0) - 1);

    assert_eq!(5, Height(7) - Height(2));
    assert_eq!(-5, Height(2) - Height(7));
}
