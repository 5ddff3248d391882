//! Atomic micro-operations.
//!
//! A `REQ_ATOMIC` request carries a list of microops sorted by attribute
//! number. Each microop names one action on one secondary attribute; the
//! replication manager applies per-attribute runs while composing the new
//! object value.

use bytes::Bytes;

use crate::AttributeType;

/// One action within an atomic request.
///
/// The numeric codes are fixed by the wire protocol. Map-typed attributes
/// have no actions: they are deliberately unsupported and fail with
/// `BADMICROS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MicroopAction {
    StringSet = 1,
    StringAppend = 2,
    StringPrepend = 3,

    Int64Set = 16,
    Int64Add = 17,
    Int64Sub = 18,
    Int64Mul = 19,
    Int64Div = 20,
    Int64Mod = 21,
    Int64And = 22,
    Int64Or = 23,
    Int64Xor = 24,

    ListLpush = 32,
    ListRpush = 33,
}

impl MicroopAction {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        use MicroopAction as A;
        let a = match code {
            1 => A::StringSet,
            2 => A::StringAppend,
            3 => A::StringPrepend,
            16 => A::Int64Set,
            17 => A::Int64Add,
            18 => A::Int64Sub,
            19 => A::Int64Mul,
            20 => A::Int64Div,
            21 => A::Int64Mod,
            22 => A::Int64And,
            23 => A::Int64Or,
            24 => A::Int64Xor,
            32 => A::ListLpush,
            33 => A::ListRpush,
            _ => return None,
        };
        Some(a)
    }

    /// The attribute type this action is legal on.
    pub fn applies_to(self) -> AttributeType {
        use MicroopAction as A;
        match self {
            A::StringSet | A::StringAppend | A::StringPrepend => AttributeType::String,
            A::Int64Set
            | A::Int64Add
            | A::Int64Sub
            | A::Int64Mul
            | A::Int64Div
            | A::Int64Mod
            | A::Int64And
            | A::Int64Or
            | A::Int64Xor => AttributeType::Int64,
            // Lists are homogeneous; the element type is carried in `ty`.
            A::ListLpush | A::ListRpush => AttributeType::Int64,
        }
    }

    pub fn is_list_op(self) -> bool {
        matches!(self, MicroopAction::ListLpush | MicroopAction::ListRpush)
    }

    pub fn is_int64_op(self) -> bool {
        matches!(
            self,
            MicroopAction::Int64Set
                | MicroopAction::Int64Add
                | MicroopAction::Int64Sub
                | MicroopAction::Int64Mul
                | MicroopAction::Int64Div
                | MicroopAction::Int64Mod
                | MicroopAction::Int64And
                | MicroopAction::Int64Or
                | MicroopAction::Int64Xor
        )
    }

    pub fn is_string_op(self) -> bool {
        matches!(
            self,
            MicroopAction::StringSet | MicroopAction::StringAppend | MicroopAction::StringPrepend
        )
    }
}

/// One micro-operation: an action applied to attribute `attr`, which the
/// client declares to have type `ty`. Integer actions read `arg_int`;
/// string and list actions read `arg_bytes`.
#[derive(Debug, Clone, PartialEq)]
pub struct Microop {
    pub attr: u16,
    pub ty: AttributeType,
    pub action: MicroopAction,
    pub arg_int: i64,
    pub arg_bytes: Bytes,
}

impl Microop {
    /// A microop carrying an integer argument.
    pub fn with_int(attr: u16, ty: AttributeType, action: MicroopAction, arg: i64) -> Self {
        Self { attr, ty, action, arg_int: arg, arg_bytes: Bytes::new() }
    }

    /// A microop carrying a byte-string argument.
    pub fn with_bytes(attr: u16, ty: AttributeType, action: MicroopAction, arg: Bytes) -> Self {
        Self { attr, ty, action, arg_int: 0, arg_bytes: arg }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_codes_roundtrip() {
        for code in 0..=255u8 {
            if let Some(a) = MicroopAction::from_u8(code) {
                assert_eq!(a.as_u8(), code);
            }
        }
        assert_eq!(MicroopAction::from_u8(0), None);
        assert_eq!(MicroopAction::from_u8(4), None);
    }

    #[test]
    fn action_categories() {
        assert!(MicroopAction::Int64Add.is_int64_op());
        assert!(!MicroopAction::Int64Add.is_string_op());
        assert!(MicroopAction::StringPrepend.is_string_op());
        assert!(MicroopAction::ListRpush.is_list_op());
    }
}
