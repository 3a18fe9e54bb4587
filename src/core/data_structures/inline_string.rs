/*!
 * Inline String
 * Allocation names and error messages without heap traffic for short text
 */

use serde::{Deserialize, Serialize};
use smartstring::alias::String as SmartString;
use std::fmt;

/// Text that stays inline up to 23 bytes
///
/// Debug names such as `"vertex-buffer"` and most error reasons fit,
/// so naming an allocation does not touch the heap.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InlineString(SmartString);

impl InlineString {
    #[inline(always)]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    #[inline]
    pub fn is_inline(&self) -> bool {
        self.0.is_inline()
    }
}

impl From<&str> for InlineString {
    fn from(text: &str) -> Self {
        Self(SmartString::from(text))
    }
}

impl From<String> for InlineString {
    fn from(text: String) -> Self {
        Self(SmartString::from(text))
    }
}

impl std::ops::Deref for InlineString {
    type Target = str;

    #[inline(always)]
    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for InlineString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
