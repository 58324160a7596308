// ABOUTME: Strongly typed snowflake identifiers for users, roles, messages, and channels.
// ABOUTME: Serialized transparently as integers and parsed from the platform's decimal strings.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<u64>().map(Self)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

snowflake!(
    /// A chat platform user.
    UserId
);
snowflake!(
    /// An access-control role allocated on the guild.
    RoleId
);
snowflake!(
    /// A single chat message. Used as the storage handle for snapshot chunks.
    MessageId
);
snowflake!(
    /// A text channel.
    ChannelId
);
