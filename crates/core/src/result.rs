//! The result-set reader.
//!
//! Invoked by the guest through `read_result_set(offset, count)` once the
//! pipelines have run. The buffer holds `count` rows of the payload schema:
//! the root schema with duplicate identifiers collapsed and constant entries
//! removed. Three materialization cases exist:
//!
//! * the payload is empty (every column constant): one template row is built
//!   from the projection's expressions and emitted `count` times, with zero
//!   buffer reads;
//! * no identifier was deduplicated: rows decode straight from the buffer
//!   and constants are re-inserted at their positions;
//! * deduplication happened: a copy program, built once, fans each decoded
//!   payload value out to every output position sharing its identifier.
//!
//! All three run behind one row materializer; the emission mode (typed
//! callback, textual print, or nothing at all) follows the root operator.

use crate::arena::ArenaError;
use crate::context::WasmContext;
use quern_lib::expr::EvalError;
use quern_lib::plan::{Operator, PrintSink, ProjectionOp, TupleCallback};
use quern_lib::schema::Schema;
use quern_lib::tuple::Tuple;
use quern_lib::types::Type;
use quern_lib::value::Value;
use std::fmt::Write as _;
use std::sync::PoisonError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("result schema carries constant columns but no projection exists on the root chain")]
    NoProjection,
    #[error("constant column `{id}` does not fold to a value")]
    ConstEval { id: String, source: EvalError },
    #[error("`read_result_set` invoked under non-sink root `{0}`")]
    RootNotSink(&'static str),
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error("result sink I/O error")]
    Io(#[from] std::io::Error),
}

/// Decodes the guest-written result buffer and feeds the root's sink.
pub fn read_result_set(ctx: &WasmContext, offset: u32, count: u32) -> Result<(), ReadError> {
    let plan = ctx.plan().clone();
    let root = plan.matched_root();
    let schema = root.schema();
    let dedup = schema.deduplicate();
    let payload = dedup.drop_constants();

    if count == 0 {
        return Ok(());
    }
    assert_eq!(
        offset == 0,
        payload.is_empty(),
        "result set offset is 0 (i.e. nullptr) iff the schema contains only constants"
    );

    let sink = match root {
        Operator::Print(op) => Sink::Print(&op.out),
        Operator::Callback(op) => Sink::Callback(&op.callback),
        Operator::NoOp(_) => return Ok(()),
        other => return Err(ReadError::RootNotSink(other.name())),
    };

    // The projection nearest the root determines the constant columns the
    // buffer omits. A plan without one cannot have constants to restore;
    // flagging that is the caller's contract, not something to synthesize.
    let needs_projection =
        payload.is_empty() || schema.iter().any(|e| e.constant && !e.ty.is_none());
    let projection = find_projection(root);
    if needs_projection && projection.is_none() {
        return Err(ReadError::NoProjection);
    }
    let constants = fold_constants(schema, projection)?;

    if payload.is_empty() {
        return emit_constant_rows(schema, &constants, count, sink);
    }

    let layout = ctx.result_set_factory().make(&payload);
    // SAFETY: the guest is suspended inside `read_result_set`; nothing
    // writes to the buffer while it is decoded.
    let bytes = unsafe { ctx.arena().slice(offset, count as usize * layout.stride)? };

    // The copy program: for each output position, where in the payload its
    // value lives. Constants have no source.
    let sources: Vec<Option<usize>> = schema
        .iter()
        .map(|e| {
            if e.constant {
                None
            } else {
                payload.find(&e.id).map(|(j, _)| j)
            }
        })
        .collect();

    let mut payload_tup = Tuple::with_len(payload.num_entries());
    let decode_row = |row: usize, tup: &mut Tuple| {
        let row_bytes = &bytes[row * layout.stride..(row + 1) * layout.stride];
        for (j, entry) in payload.iter().enumerate() {
            match layout.read_value(row_bytes, j, &entry.ty) {
                Some(v) => tup.set(j, v),
                None => tup.unset(j),
            }
        }
    };

    match sink {
        Sink::Callback(cb) => {
            let mut out = Tuple::new(schema);
            for (i, c) in constants.iter().enumerate() {
                if let Some(v) = c {
                    out.set(i, v.clone());
                }
            }
            let mut cb = cb.lock().unwrap_or_else(PoisonError::into_inner);
            for row in 0..count as usize {
                decode_row(row, &mut payload_tup);
                for (i, src) in sources.iter().enumerate() {
                    if let Some(j) = src {
                        match payload_tup.get(*j) {
                            Some(v) => out.set(i, v.clone()),
                            None => out.unset(i),
                        }
                    }
                }
                (&mut *cb)(schema, &out);
            }
        }
        Sink::Print(out) => {
            let mut line = String::new();
            let mut out = out.lock().unwrap_or_else(PoisonError::into_inner);
            for row in 0..count as usize {
                decode_row(row, &mut payload_tup);
                line.clear();
                for (i, entry) in schema.iter().enumerate() {
                    if i != 0 {
                        line.push(',');
                    }
                    let value = match &sources[i] {
                        Some(j) => payload_tup.get(*j),
                        None => constants[i].as_ref(),
                    };
                    format_value(&mut line, &entry.ty, value);
                }
                line.push('\n');
                out.write_all(line.as_bytes())?;
            }
        }
    }
    Ok(())
}

enum Sink<'a> {
    Print(&'a PrintSink),
    Callback(&'a TupleCallback),
}

/// The projection nearest the root along the single-child chain, if any.
fn find_projection(op: &Operator) -> Option<&ProjectionOp> {
    match op {
        Operator::Projection(p) => Some(p),
        _ => {
            let children = op.children();
            let [child] = children.as_slice() else {
                return None;
            };
            debug_assert_eq!(
                op.schema().num_entries(),
                child.schema().num_entries(),
                "operators above the projection must forward its schema"
            );
            find_projection(child)
        }
    }
}

/// Folds the constant column values out of the projection, indexed by
/// schema position; non-constant and NULL-typed positions stay `None`.
fn fold_constants(
    schema: &Schema,
    projection: Option<&ProjectionOp>,
) -> Result<Vec<Option<Value>>, ReadError> {
    let mut out = vec![None; schema.num_entries()];
    let Some(projection) = projection else {
        return Ok(out);
    };
    debug_assert_eq!(projection.schema.num_entries(), schema.num_entries());
    for (i, entry) in schema.iter().enumerate() {
        if !entry.constant || entry.ty.is_none() {
            continue;
        }
        let expr = &projection.projections[i].0;
        out[i] = expr.eval_const().map_err(|source| ReadError::ConstEval {
            id: entry.id.clone(),
            source,
        })?;
    }
    Ok(out)
}

/// Case A: every column is constant. One template row, no buffer reads.
fn emit_constant_rows(
    schema: &Schema,
    constants: &[Option<Value>],
    count: u32,
    sink: Sink<'_>,
) -> Result<(), ReadError> {
    match sink {
        Sink::Callback(cb) => {
            let mut tup = Tuple::new(schema);
            for (i, c) in constants.iter().enumerate() {
                if let Some(v) = c {
                    tup.set(i, v.clone());
                }
            }
            let mut cb = cb.lock().unwrap_or_else(PoisonError::into_inner);
            for _ in 0..count {
                (&mut *cb)(schema, &tup);
            }
        }
        Sink::Print(out) => {
            let mut line = String::new();
            for (i, entry) in schema.iter().enumerate() {
                if i != 0 {
                    line.push(',');
                }
                format_value(&mut line, &entry.ty, constants[i].as_ref());
            }
            line.push('\n');
            let mut out = out.lock().unwrap_or_else(PoisonError::into_inner);
            for _ in 0..count {
                out.write_all(line.as_bytes())?;
            }
        }
    }
    Ok(())
}

/* --------------------------- print formatting -------------------------- */

/// Renders one column value the way the print sink expects it.
pub fn format_value(out: &mut String, ty: &Type, value: Option<&Value>) {
    let Some(value) = value else {
        out.push_str("NULL");
        return;
    };
    match (ty, value) {
        (Type::None, _) => out.push_str("NULL"),
        (Type::Bool, Value::Bool(b)) => out.push_str(if *b { "TRUE" } else { "FALSE" }),
        (Type::I8 | Type::I16 | Type::I32 | Type::I64 | Type::Decimal { .. }, Value::Int(i)) => {
            let _ = write!(out, "{i}");
        }
        (Type::F32, Value::Float(f)) => out.push_str(&format_float(*f, 8)),
        (Type::F64, Value::Float(f)) => out.push_str(&format_float(*f, 16)),
        (Type::Char(_), Value::Str(s)) => {
            // Contract: result strings never contain a double quote.
            let _ = write!(out, "\"{s}\"");
        }
        (Type::Date, Value::Date(d)) => format_date(out, *d),
        (Type::DateTime, Value::DateTime(t)) => format_datetime(out, *t),
        _ => out.push_str("NULL"),
    }
}

/// Bit-packed date `year << 9 | month << 5 | day`. Years are zero-padded to
/// at least four digits; a negative year keeps its sign and takes one extra
/// column.
fn format_date(out: &mut String, date: i32) {
    let year = date >> 9;
    let month = (date >> 5) & 0xF;
    let day = date & 0x1F;
    if year > 0 {
        let _ = write!(out, "{year:04}");
    } else if year == 0 {
        let _ = write!(out, "{year:05}");
    } else {
        let _ = write!(out, "-{:04}", -i64::from(year));
    }
    let _ = write!(out, "-{month:02}-{day:02}");
}

/// Unix seconds, rendered as broken-down UTC time.
fn format_datetime(out: &mut String, seconds: i64) {
    match chrono::DateTime::from_timestamp(seconds, 0) {
        Some(dt) => {
            let _ = write!(out, "{}", dt.format("%Y-%m-%d %H:%M:%S"));
        }
        None => {
            let _ = write!(out, "{seconds}");
        }
    }
}

/// Default-notation float rendering with `sig` significant digits and
/// trailing zeros trimmed. `sig` is `max_digits10 - 1` of the column's
/// float width.
fn format_float(x: f64, sig: i32) -> String {
    if x.is_nan() {
        return "nan".into();
    }
    if x.is_infinite() {
        return if x < 0.0 { "-inf".into() } else { "inf".into() };
    }
    if x == 0.0 {
        return "0".into();
    }
    let exp = x.abs().log10().floor() as i32;
    if exp < -4 || exp >= sig {
        let s = format!("{:.*e}", (sig - 1) as usize, x);
        let Some(epos) = s.find('e') else { return s };
        let mantissa = s[..epos].trim_end_matches('0').trim_end_matches('.');
        let exponent: i32 = s[epos + 1..].parse().unwrap_or(0);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    } else {
        let decimals = (sig - 1 - exp).max(0) as usize;
        let s = format!("{x:.decimals$}");
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.').to_owned()
        } else {
            s
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(ty: Type, v: Value) -> String {
        let mut s = String::new();
        format_value(&mut s, &ty, Some(&v));
        s
    }

    #[test]
    fn booleans_render_upper_case() {
        assert_eq!(fmt(Type::Bool, Value::Bool(true)), "TRUE");
        assert_eq!(fmt(Type::Bool, Value::Bool(false)), "FALSE");
    }

    #[test]
    fn null_renders_for_absent_and_none_typed_values() {
        let mut s = String::new();
        format_value(&mut s, &Type::I32, None);
        assert_eq!(s, "NULL");
        assert_eq!(fmt(Type::None, Value::Int(1)), "NULL");
    }

    #[test]
    fn dates_zero_pad_the_year() {
        use quern_lib::value::pack_date;
        assert_eq!(fmt(Type::Date, Value::Date(pack_date(2024, 1, 31))), "2024-01-31");
        assert_eq!(fmt(Type::Date, Value::Date(pack_date(-5, 3, 2))), "-0005-03-02");
        assert_eq!(fmt(Type::Date, Value::Date(pack_date(33, 12, 1))), "0033-12-01");
    }

    #[test]
    fn datetimes_render_broken_down_utc() {
        assert_eq!(
            fmt(Type::DateTime, Value::DateTime(0)),
            "1970-01-01 00:00:00"
        );
        assert_eq!(
            fmt(Type::DateTime, Value::DateTime(951782400)),
            "2000-02-29 00:00:00"
        );
    }

    #[test]
    fn strings_are_quoted_verbatim() {
        assert_eq!(fmt(Type::Char(8), Value::Str("x".into())), "\"x\"");
    }

    #[test]
    fn floats_trim_trailing_zeros() {
        assert_eq!(format_float(2.5, 8), "2.5");
        assert_eq!(format_float(-0.125, 16), "-0.125");
        assert_eq!(format_float(0.0, 8), "0");
        assert_eq!(format_float(1.0e20, 16), "1e+20");
        assert_eq!(format_float(3.0e-7, 8), "3e-07");
    }

    #[test]
    fn float_formatting_round_trips() {
        for v in [1.5f64, -2.25, 123456.75, 0.015625] {
            let s = format_float(v, 16);
            assert_eq!(s.parse::<f64>().unwrap(), v, "{s}");
        }
        for v in [1.5f32, -2.25, 0.875] {
            let s = format_float(f64::from(v), 8);
            assert_eq!(s.parse::<f32>().unwrap(), v, "{s}");
        }
    }

    #[test]
    fn integer_rendering_uses_stored_bits() {
        assert_eq!(fmt(Type::Decimal { scale: 2 }, Value::Int(12345)), "12345");
        assert_eq!(fmt(Type::I64, Value::Int(-7)), "-7");
    }
}
