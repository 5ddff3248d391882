//! Applying micro-operations to stored values.
//!
//! `client_atomic` hands each attribute's run of microops to
//! [`apply_microops`], which produces the attribute's new bytes from its
//! old bytes. Int64 arithmetic wraps two's-complement; division and
//! modulus by zero fail with `OVERFLOW`. Map attributes have no microops
//! and fail with `BADMICROS`.

use bytes::{BufMut, Bytes, BytesMut};
use hyperdex_types::{AttributeType, Microop, MicroopAction, ReturnCode, ScalarType};

/// Applies one attribute's run of microops to its old value, returning
/// the new bytes. `ops` is non-empty and every op names the same
/// attribute.
pub fn apply_microops(
    ty: AttributeType,
    old_value: &[u8],
    ops: &[Microop],
) -> Result<Bytes, ReturnCode> {
    match ty {
        AttributeType::String => apply_string(old_value, ops),
        AttributeType::Int64 => apply_int64(old_value, ops),
        AttributeType::List(elem) => apply_list(elem, old_value, ops),
        // Floats, documents, sets, and maps have no microops. Map
        // support in particular is deliberately absent.
        _ => Err(ReturnCode::BadMicros),
    }
}

/// String microops: at most one set (alone), at most one prepend, at
/// most one append.
fn apply_string(old_value: &[u8], ops: &[Microop]) -> Result<Bytes, ReturnCode> {
    let mut base: &[u8] = old_value;
    let mut set_base = false;
    let mut prepend: Option<&Microop> = None;
    let mut append: Option<&Microop> = None;

    for op in ops {
        match op.action {
            MicroopAction::StringSet => {
                if set_base || prepend.is_some() || append.is_some() {
                    return Err(ReturnCode::BadMicros);
                }
                base = &op.arg_bytes;
                set_base = true;
            }
            MicroopAction::StringPrepend => {
                if set_base || prepend.is_some() {
                    return Err(ReturnCode::BadMicros);
                }
                prepend = Some(op);
            }
            MicroopAction::StringAppend => {
                if set_base || append.is_some() {
                    return Err(ReturnCode::BadMicros);
                }
                append = Some(op);
            }
            _ => return Err(ReturnCode::BadMicros),
        }
    }

    let mut out = BytesMut::new();
    if let Some(op) = prepend {
        out.put_slice(&op.arg_bytes);
    }
    out.put_slice(base);
    if let Some(op) = append {
        out.put_slice(&op.arg_bytes);
    }
    Ok(out.freeze())
}

/// Int64 microops applied sequentially. Arithmetic wraps.
fn apply_int64(old_value: &[u8], ops: &[Microop]) -> Result<Bytes, ReturnCode> {
    let mut number = int64_from_bytes(old_value);

    for op in ops {
        number = match op.action {
            MicroopAction::Int64Set => op.arg_int,
            MicroopAction::Int64Add => number.wrapping_add(op.arg_int),
            MicroopAction::Int64Sub => number.wrapping_sub(op.arg_int),
            MicroopAction::Int64Mul => number.wrapping_mul(op.arg_int),
            MicroopAction::Int64Div => {
                if op.arg_int == 0 {
                    return Err(ReturnCode::Overflow);
                }
                number.wrapping_div(op.arg_int)
            }
            MicroopAction::Int64Mod => {
                if op.arg_int == 0 {
                    return Err(ReturnCode::Overflow);
                }
                number.wrapping_rem(op.arg_int)
            }
            MicroopAction::Int64And => number & op.arg_int,
            MicroopAction::Int64Or => number | op.arg_int,
            MicroopAction::Int64Xor => number ^ op.arg_int,
            _ => return Err(ReturnCode::BadMicros),
        };
    }

    Ok(Bytes::copy_from_slice(&number.to_le_bytes()))
}

/// List microops: lpushes land before the old list in reverse arrival
/// order, rpushes after it in arrival order.
fn apply_list(elem: ScalarType, old_value: &[u8], ops: &[Microop]) -> Result<Bytes, ReturnCode> {
    for op in ops {
        if !op.action.is_list_op() {
            return Err(ReturnCode::BadMicros);
        }
    }

    let mut out = BytesMut::new();
    for op in ops.iter().rev() {
        if op.action == MicroopAction::ListLpush {
            put_list_elem(&mut out, elem, op);
        }
    }
    out.put_slice(old_value);
    for op in ops {
        if op.action == MicroopAction::ListRpush {
            put_list_elem(&mut out, elem, op);
        }
    }
    Ok(out.freeze())
}

fn put_list_elem(out: &mut BytesMut, elem: ScalarType, op: &Microop) {
    match elem {
        ScalarType::String => {
            out.put_u32_le(op.arg_bytes.len() as u32);
            out.put_slice(&op.arg_bytes);
        }
        ScalarType::Int64 => out.put_i64_le(op.arg_int),
        ScalarType::Float => out.put_slice(&op.arg_bytes),
    }
}

/// Reads a possibly short little-endian int64, zero-extending.
pub fn int64_from_bytes(data: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    let n = data.len().min(8);
    raw[..n].copy_from_slice(&data[..n]);
    i64::from_le_bytes(raw)
}
