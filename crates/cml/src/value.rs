//! Runtime value representation.
//!
//! Every value the interpreter touches is a [`Value`]: a class id, a const
//! flag, an in-use flag for temp pooling, and a [`ValueData`] payload. The
//! payload set is closed over the intrinsic classes plus two structural
//! variants: `User` for instances of macro-defined classes and `Collection`
//! for the nested array/vector types. Structural variants hold [`ValueId`]
//! handles into the engine heap rather than inline values, which is what
//! gives members, locals, parameters, and collection elements their shared
//! reference semantics.
//!
//! Deep operations (construction, copy, formatting of user values) live on
//! the heap, which can chase member handles; this module covers the scalar
//! payloads.

use serde::{Deserialize, Serialize};

use crate::{
    error::ExceptInfo,
    heap::ValueId,
    types::{ClassId, Intrinsic},
};

/// A runtime value.
#[derive(Debug, Clone)]
pub struct Value {
    class_id: ClassId,
    is_const: bool,
    in_use: bool,
    pub data: ValueData,
}

impl Value {
    #[must_use]
    pub fn new(class_id: ClassId, is_const: bool, data: ValueData) -> Self {
        Self {
            class_id,
            is_const,
            in_use: false,
            data,
        }
    }

    #[must_use]
    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    #[must_use]
    pub fn is_const(&self) -> bool {
        self.is_const
    }

    pub fn set_const(&mut self, is_const: bool) {
        self.is_const = is_const;
    }

    /// Temp-pool borrow flag. Set while the value is on the call stack.
    #[must_use]
    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }
}

/// The payload of a value, tagged by intrinsic kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueData {
    Void,
    Boolean(bool),
    Char(char),
    Card1(u8),
    Card2(u16),
    Card4(u32),
    Card8(u64),
    Int1(i8),
    Int2(i16),
    Int4(i32),
    Float4(f32),
    Float8(f64),
    String(String),
    StringList(Vec<String>),
    MemBuf(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    Time(u64),
    /// Ordinal into the owning enum class's item list.
    Enum(u32),
    /// Mirror of the engine's thrown-exception payload.
    Except(ExceptInfo),
    /// Text accumulation buffer backing the output stream classes.
    OutStream(String),
    /// Instance of a macro-defined class; one handle per member, in the
    /// owning class's member order (inherited first).
    User(Vec<ValueId>),
    /// Nested array/vector instance; one handle per element.
    Collection(Vec<ValueId>),
}

impl ValueData {
    /// Default payload for an intrinsic class.
    ///
    /// User and collection classes need the registry to build their member
    /// vectors, which the heap's storage factory handles.
    #[must_use]
    pub fn scalar_default(intrinsic: Intrinsic) -> Self {
        match intrinsic {
            Intrinsic::Object | Intrinsic::Void | Intrinsic::Formattable => Self::Void,
            Intrinsic::Boolean => Self::Boolean(false),
            Intrinsic::Char => Self::Char('\0'),
            Intrinsic::String => Self::String(String::new()),
            Intrinsic::Card1 => Self::Card1(0),
            Intrinsic::Card2 => Self::Card2(0),
            Intrinsic::Card4 => Self::Card4(0),
            Intrinsic::Card8 => Self::Card8(0),
            Intrinsic::Float4 => Self::Float4(0.0),
            Intrinsic::Float8 => Self::Float8(0.0),
            Intrinsic::Int1 => Self::Int1(0),
            Intrinsic::Int2 => Self::Int2(0),
            Intrinsic::Int4 => Self::Int4(0),
            Intrinsic::Time => Self::Time(0),
            Intrinsic::StringList => Self::StringList(Vec::new()),
            Intrinsic::Enum | Intrinsic::BaseInfo => Self::Enum(0),
            Intrinsic::Exception => Self::Except(ExceptInfo::default()),
            Intrinsic::MemBuf => Self::MemBuf(Vec::new()),
            Intrinsic::TextOutStream | Intrinsic::StringOutStream => Self::OutStream(String::new()),
        }
    }

    /// Whether this payload owns heap handles that must be released with it.
    #[must_use]
    pub fn child_ids(&self) -> Option<&[ValueId]> {
        match self {
            Self::User(ids) | Self::Collection(ids) => Some(ids),
            _ => None,
        }
    }

    /// The boolean payload, when this is a Boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// The enum ordinal, when this is an enum value.
    #[must_use]
    pub fn as_ordinal(&self) -> Option<u32> {
        match self {
            Self::Enum(ord) => Some(*ord),
            _ => None,
        }
    }

    /// Widens any integral payload (including Char and Boolean) to i128.
    #[must_use]
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Self::Boolean(b) => Some(i128::from(*b)),
            Self::Char(c) => Some(i128::from(*c as u32)),
            Self::Card1(v) => Some(i128::from(*v)),
            Self::Card2(v) => Some(i128::from(*v)),
            Self::Card4(v) => Some(i128::from(*v)),
            Self::Card8(v) => Some(i128::from(*v)),
            Self::Int1(v) => Some(i128::from(*v)),
            Self::Int2(v) => Some(i128::from(*v)),
            Self::Int4(v) => Some(i128::from(*v)),
            Self::Enum(v) => Some(i128::from(*v)),
            Self::Time(v) => Some(i128::from(*v)),
            _ => None,
        }
    }

    /// Widens any numeric payload to f64.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float4(v) => Some(f64::from(*v)),
            Self::Float8(v) => Some(*v),
            other => other.as_i128().map(|v| v as f64),
        }
    }

    /// Builds an integral payload of the given intrinsic from a wide value,
    /// failing when the value does not fit the width.
    #[must_use]
    pub fn from_i128(intrinsic: Intrinsic, v: i128) -> Option<Self> {
        match intrinsic {
            Intrinsic::Card1 => u8::try_from(v).ok().map(Self::Card1),
            Intrinsic::Card2 => u16::try_from(v).ok().map(Self::Card2),
            Intrinsic::Card4 => u32::try_from(v).ok().map(Self::Card4),
            Intrinsic::Card8 => u64::try_from(v).ok().map(Self::Card8),
            Intrinsic::Int1 => i8::try_from(v).ok().map(Self::Int1),
            Intrinsic::Int2 => i16::try_from(v).ok().map(Self::Int2),
            Intrinsic::Int4 => i32::try_from(v).ok().map(Self::Int4),
            Intrinsic::Float4 => Some(Self::Float4(v as f32)),
            Intrinsic::Float8 => Some(Self::Float8(v as f64)),
            Intrinsic::Char => u32::try_from(v).ok().and_then(char::from_u32).map(Self::Char),
            Intrinsic::Boolean => Some(Self::Boolean(v != 0)),
            _ => None,
        }
    }

    /// Formats the scalar payload for debugger display.
    ///
    /// Returns false for structural payloads, which the heap formats by
    /// walking members.
    pub fn dbg_format(&self, out: &mut String, radix: u32) -> bool {
        use std::fmt::Write;
        match self {
            Self::Void => out.push_str("<void>"),
            Self::Boolean(b) => out.push_str(if *b { "True" } else { "False" }),
            Self::Char(c) => {
                let _ = write!(out, "'{c}'");
            }
            Self::String(s) => {
                let _ = write!(out, "\"{s}\"");
            }
            Self::Float4(v) => {
                let _ = write!(out, "{v}");
            }
            Self::Float8(v) => {
                let _ = write!(out, "{v}");
            }
            Self::StringList(items) => {
                let _ = write!(out, "<{} strings>", items.len());
            }
            Self::MemBuf(bytes) => {
                let _ = write!(out, "<{} bytes>", bytes.len());
            }
            Self::Time(ms) => {
                let _ = write!(out, "{ms}ms");
            }
            Self::Enum(ord) => {
                let _ = write!(out, "ord {ord}");
            }
            Self::Except(info) => {
                let _ = write!(out, "{}.{} ({})", info.class_path, info.name, info.text);
            }
            Self::OutStream(buf) => {
                let _ = write!(out, "<stream, {} chars>", buf.len());
            }
            other => {
                if let Some(v) = other.as_i128() {
                    if radix == 16 {
                        let _ = write!(out, "{v:#x}");
                    } else {
                        let _ = write!(out, "{v}");
                    }
                } else {
                    return false;
                }
            }
        }
        true
    }

    /// Formats the payload the way macro-level formatting sees it (no
    /// quoting, no type adornment). Structural payloads return None.
    #[must_use]
    pub fn format_plain(&self) -> Option<String> {
        match self {
            Self::Void => Some(String::new()),
            Self::Boolean(b) => Some(if *b { "True" } else { "False" }.to_owned()),
            Self::Char(c) => Some(c.to_string()),
            Self::String(s) | Self::OutStream(s) => Some(s.clone()),
            Self::Float4(v) => Some(v.to_string()),
            Self::Float8(v) => Some(v.to_string()),
            Self::Time(ms) => Some(ms.to_string()),
            other => other.as_i128().map(|v| v.to_string()),
        }
    }

    /// Parses text into this payload in place, for primitives only.
    ///
    /// Accepts the forms the macro language itself uses: `True`/`False`,
    /// decimal and `0x` hex integers, standard float syntax, single chars.
    pub fn parse_from_text(&mut self, text: &str) -> bool {
        fn parse_int(text: &str) -> Option<i128> {
            let text = text.trim();
            let (negative, digits) = match text.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, text),
            };
            let magnitude = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
                i128::from_str_radix(hex, 16).ok()?
            } else {
                digits.parse::<i128>().ok()?
            };
            Some(if negative { -magnitude } else { magnitude })
        }

        match self {
            Self::Boolean(b) => match text.trim() {
                "True" => {
                    *b = true;
                    true
                }
                "False" => {
                    *b = false;
                    true
                }
                _ => false,
            },
            Self::Char(c) => {
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(ch), None) => {
                        *c = ch;
                        true
                    }
                    _ => false,
                }
            }
            Self::String(s) => {
                *s = text.to_owned();
                true
            }
            Self::Float4(v) => text.trim().parse().map(|p| *v = p).is_ok(),
            Self::Float8(v) => text.trim().parse().map(|p| *v = p).is_ok(),
            Self::Card1(v) => parse_int(text).and_then(|p| u8::try_from(p).ok()).map(|p| *v = p).is_some(),
            Self::Card2(v) => parse_int(text).and_then(|p| u16::try_from(p).ok()).map(|p| *v = p).is_some(),
            Self::Card4(v) => parse_int(text).and_then(|p| u32::try_from(p).ok()).map(|p| *v = p).is_some(),
            Self::Card8(v) => parse_int(text).and_then(|p| u64::try_from(p).ok()).map(|p| *v = p).is_some(),
            Self::Int1(v) => parse_int(text).and_then(|p| i8::try_from(p).ok()).map(|p| *v = p).is_some(),
            Self::Int2(v) => parse_int(text).and_then(|p| i16::try_from(p).ok()).map(|p| *v = p).is_some(),
            Self::Int4(v) => parse_int(text).and_then(|p| i32::try_from(p).ok()).map(|p| *v = p).is_some(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_round_trip_through_text() {
        for intrinsic in [
            Intrinsic::Card1,
            Intrinsic::Card2,
            Intrinsic::Card4,
            Intrinsic::Card8,
            Intrinsic::Int1,
            Intrinsic::Int2,
            Intrinsic::Int4,
        ] {
            let mut data = ValueData::scalar_default(intrinsic);
            let original = ValueData::from_i128(intrinsic, 97).unwrap();
            let formatted = original.format_plain().unwrap();
            assert!(data.parse_from_text(&formatted));
            assert_eq!(data, original, "{intrinsic} round trip");
        }
    }

    #[test]
    fn hex_and_negative_parses() {
        let mut card = ValueData::Card4(0);
        assert!(card.parse_from_text("0x1A"));
        assert_eq!(card, ValueData::Card4(26));

        let mut int = ValueData::Int2(0);
        assert!(int.parse_from_text("-300"));
        assert_eq!(int, ValueData::Int2(-300));

        let mut narrow = ValueData::Card1(0);
        assert!(!narrow.parse_from_text("300"));
    }

    #[test]
    fn width_checks_on_from_i128() {
        assert_eq!(ValueData::from_i128(Intrinsic::Card2, 65535), Some(ValueData::Card2(65535)));
        assert_eq!(ValueData::from_i128(Intrinsic::Card2, 65536), None);
        assert_eq!(ValueData::from_i128(Intrinsic::Int1, -129), None);
        assert_eq!(ValueData::from_i128(Intrinsic::Card4, -1), None);
    }
}
