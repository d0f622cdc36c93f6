use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Opaque identity of a persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

/// Identity of a member. Equal to the auth identity of the account behind it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(MessageId);
string_id!(UserId);

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
pub(crate) fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct ParentField {
        #[serde(default, deserialize_with = "deserialize_present")]
        parent: Option<Option<MessageId>>,
    }

    #[test]
    fn test_ids_are_transparent_strings() {
        let id = MessageId::new("m1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"m1\"");
        let user: UserId = serde_json::from_str("\"u1\"").unwrap();
        assert_eq!(user.as_str(), "u1");
        assert_eq!(user.to_string(), "u1");
    }

    #[test]
    fn test_deserialize_present_distinguishes_null_from_missing() {
        let missing: ParentField = serde_json::from_str("{}").unwrap();
        assert_eq!(missing.parent, None);

        let null: ParentField = serde_json::from_str(r#"{"parent": null}"#).unwrap();
        assert_eq!(null.parent, Some(None));

        let set: ParentField = serde_json::from_str(r#"{"parent": "m0"}"#).unwrap();
        assert_eq!(set.parent, Some(Some(MessageId::new("m0"))));
    }
}
