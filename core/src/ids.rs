//! Strongly typed identifiers.
//!
//! All identifiers are 64-bit signed integers on the wire and in the durable
//! store. The newtypes keep offer, buyer and order ids from being swapped at
//! call sites (`try_admit(offer, buyer)` vs `try_admit(buyer, offer)`).

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Wrap a raw identifier.
            #[must_use]
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            /// The raw identifier.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Identifier of a time-boxed offer.
    OfferId
);

id_type!(
    /// Identifier of a buyer.
    BuyerId
);

id_type!(
    /// Globally unique, time-ordered order identifier (see [`crate::id_gen`]).
    OrderId
);
