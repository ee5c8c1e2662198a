//! Tri-state configuration fields.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One field of a partial configuration layer.
///
/// `Absent` and `Cleared` are different things: an absent field leaves the
/// outer layer's value alone, a cleared field overrides it with "nothing"
/// (which disables the feature). In serde documents a missing field is
/// `Absent` and an explicit `null` is `Cleared`; pair the field with
/// `#[serde(default, skip_serializing_if = "Setting::is_absent")]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting<T> {
    /// The layer has no opinion.
    Absent,
    /// The layer explicitly unsets the field.
    Cleared,
    /// The layer sets the field.
    Value(T),
}

impl<T> Default for Setting<T> {
    fn default() -> Self {
        Self::Absent
    }
}

impl<T> Setting<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn is_cleared(&self) -> bool {
        matches!(self, Self::Cleared)
    }

    /// True for `Cleared` and `Value`, the two states that override.
    pub fn is_present(&self) -> bool {
        !self.is_absent()
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Setting<U> {
        match self {
            Self::Absent => Setting::Absent,
            Self::Cleared => Setting::Cleared,
            Self::Value(v) => Setting::Value(f(v)),
        }
    }

    /// Compare with a custom equality for the payload.
    pub fn eq_by(&self, other: &Self, eq: impl FnOnce(&T, &T) -> bool) -> bool {
        match (self, other) {
            (Self::Absent, Self::Absent) | (Self::Cleared, Self::Cleared) => true,
            (Self::Value(a), Self::Value(b)) => eq(a, b),
            _ => false,
        }
    }
}

impl<T: Clone> Setting<T> {
    /// `inner` shadows `self` unless `inner` is absent.
    pub fn overlay(&self, inner: &Setting<T>) -> Setting<T> {
        if inner.is_present() {
            inner.clone()
        } else {
            self.clone()
        }
    }

    /// Collapse to a concrete value: `default` when absent, `disabled` when cleared.
    pub fn resolve_or(&self, default: T, disabled: T) -> T {
        match self {
            Self::Absent => default,
            Self::Cleared => disabled,
            Self::Value(v) => v.clone(),
        }
    }
}

impl<T> From<Option<T>> for Setting<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Self::Value(v),
            None => Self::Cleared,
        }
    }
}

impl<T: Serialize> Serialize for Setting<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(v) => serializer.serialize_some(v),
            Self::Absent | Self::Cleared => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Setting<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Setting::from)
    }
}
