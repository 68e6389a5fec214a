// Copyright 2023 The Wrangle Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::content_hash::HASH_LEN;
use crate::content_hash::HashSum;

pub trait ObjectId {
    fn object_type(&self) -> String;
    fn as_bytes(&self) -> &[u8];
    fn to_bytes(&self) -> Vec<u8>;
    fn hex(&self) -> String;
}

// Defines a new struct type with visibility `vis` and name `ident` containing
// a 16-byte content digest. Types defined using this macro automatically
// implement the `ObjectId` trait. Documentation comments written inside the
// macro invocation are attached to the generated type.
macro_rules! id_type {
    (   $(#[$attr:meta])*
        $vis:vis $name:ident
    ) => {
        $(#[$attr])*
        #[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
        $vis struct $name($crate::content_hash::HashSum);
        $crate::object_id::impl_id_type!($name);
    };
}

macro_rules! impl_id_type {
    ($name:ident) => {
        impl $name {
            pub fn new(value: $crate::content_hash::HashSum) -> Self {
                Self(value)
            }

            /// Wraps `bytes`, which must be exactly 16 bytes long.
            pub fn try_from_bytes(bytes: &[u8]) -> Option<Self> {
                let value: $crate::content_hash::HashSum = bytes.try_into().ok()?;
                Some(Self(value))
            }

            /// Parses the given hex string into an id.
            ///
            /// The given string must be valid. A static str is required to
            /// prevent API misuse.
            pub fn from_hex(hex: &'static str) -> Self {
                Self::try_from_hex(hex).unwrap()
            }

            /// Parses the given hex string into an id.
            pub fn try_from_hex(hex: impl AsRef<[u8]>) -> Option<Self> {
                let bytes = hex::decode(hex).ok()?;
                Self::try_from_bytes(&bytes)
            }

            pub fn sum(&self) -> $crate::content_hash::HashSum {
                self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                f.debug_tuple(stringify!($name))
                    .field(&$crate::object_id::ObjectId::hex(self))
                    .finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                f.pad(&$crate::object_id::ObjectId::hex(self))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                $crate::object_id::ObjectId::hex(self).serialize(serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let hex = String::deserialize(deserializer)?;
                Self::try_from_hex(&hex)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid id {hex:?}")))
            }
        }

        impl $crate::object_id::ObjectId for $name {
            fn object_type(&self) -> String {
                stringify!($name)
                    .strip_suffix("Id")
                    .unwrap()
                    .to_ascii_lowercase()
                    .to_string()
            }

            fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            fn to_bytes(&self) -> Vec<u8> {
                self.0.to_vec()
            }

            fn hex(&self) -> String {
                hex::encode(self.0)
            }
        }
    };
}

pub(crate) use id_type;
pub(crate) use impl_id_type;

/// Parses a 32-digit hex string into a raw digest.
pub fn sum_from_hex(hex: impl AsRef<[u8]>) -> Option<HashSum> {
    let bytes = hex::decode(hex).ok()?;
    (bytes.len() == HASH_LEN).then(|| bytes.try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::CommitId;
    use crate::objects::TableId;

    #[test]
    fn test_display_object_id() {
        let commit_id = CommitId::from_hex("0123456789abcdef0123456789abcdef");
        assert_eq!(format!("{commit_id}"), "0123456789abcdef0123456789abcdef");
        assert_eq!(format!("{commit_id:.7}"), "0123456");
    }

    #[test]
    fn test_object_type() {
        let id = TableId::new([0; 16]);
        assert_eq!(id.object_type(), "table");
    }

    #[test]
    fn test_try_from_hex() {
        assert_eq!(
            CommitId::try_from_hex("0123456789abcdef0123456789abcdef"),
            Some(CommitId::new([
                0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89,
                0xab, 0xcd, 0xef
            ]))
        );
        // too short, odd length, invalid digits
        assert_eq!(CommitId::try_from_hex("0123"), None);
        assert_eq!(CommitId::try_from_hex("012"), None);
        assert_eq!(CommitId::try_from_hex("xyz"), None);
    }

    #[test]
    fn test_sum_from_hex() {
        assert_eq!(
            sum_from_hex("00000000000000000000000000000000"),
            Some([0; 16])
        );
        assert_eq!(sum_from_hex("0000"), None);
    }
}
