//! The parameter-value universe shared by capture (decoding a client's
//! `COM_STMT_EXECUTE`) and replay (re-binding the same values against the
//! target). A single `ParamValue` tag carries a decoded parameter from one
//! side of the crate to the other through the event log untouched.

use crate::error::{Error, Result};
use crate::constant::ColumnType;
use crate::wire::primitive::*;

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    /// `NEWDECIMAL`/`DECIMAL`, kept as MySQL's own decimal text form.
    Decimal(String),
    /// `DATE`/`DATETIME`/`TIMESTAMP`/`TIME`, rendered to an ISO-ish text
    /// form so the event log line stays human-diffable.
    DateTime(String),
    Bytes(Vec<u8>),
    Text(String),
}

impl ParamValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Null)
    }
}

/// A parameter's 2-byte type tag as carried in `COM_STMT_EXECUTE`'s type
/// block: the MySQL column type plus the unsigned flag.
pub type ParamType = (ColumnType, bool);

fn decode_length_prefixed_temporal(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let (len, rest) = read_int_1(data)?;
    read_string_fix(rest, len as usize)
}

fn format_date(y: u16, m: u8, d: u8) -> String {
    format!("{:04}-{:02}-{:02}", y, m, d)
}

fn decode_temporal_date_time<'a>(data: &'a [u8]) -> Result<(String, &'a [u8])> {
    let (body, rest) = decode_length_prefixed_temporal(data)?;
    let text = match body.len() {
        0 => String::new(),
        4 => {
            let (y, b) = read_int_2(body)?;
            let (m, b) = read_int_1(b)?;
            let (d, _) = read_int_1(b)?;
            format_date(y, m, d)
        }
        7 | 11 => {
            let (y, b) = read_int_2(body)?;
            let (m, b) = read_int_1(b)?;
            let (d, b) = read_int_1(b)?;
            let (h, b) = read_int_1(b)?;
            let (min, b) = read_int_1(b)?;
            let (s, b) = read_int_1(b)?;
            if body.len() == 11 {
                let (micro, _) = read_int_4(b)?;
                format!(
                    "{} {:02}:{:02}:{:02}.{:06}",
                    format_date(y, m, d),
                    h,
                    min,
                    s,
                    micro
                )
            } else {
                format!("{} {:02}:{:02}:{:02}", format_date(y, m, d), h, min, s)
            }
        }
        _ => return Err(Error::Framing("unsupported DATETIME length")),
    };
    Ok((text, rest))
}

fn decode_temporal_time<'a>(data: &'a [u8]) -> Result<(String, &'a [u8])> {
    let (body, rest) = decode_length_prefixed_temporal(data)?;
    let text = match body.len() {
        0 => String::new(),
        8 | 12 => {
            let (is_negative, b) = read_int_1(body)?;
            let (days, b) = read_int_4(b)?;
            let (h, b) = read_int_1(b)?;
            let (m, b) = read_int_1(b)?;
            let (s, b) = read_int_1(b)?;
            let sign = if is_negative != 0 { "-" } else { "" };
            if body.len() == 12 {
                let (micro, _) = read_int_4(b)?;
                format!("{}{} {:02}:{:02}:{:02}.{:06}", sign, days, h, m, s, micro)
            } else {
                format!("{}{} {:02}:{:02}:{:02}", sign, days, h, m, s)
            }
        }
        _ => return Err(Error::Framing("unsupported TIME length")),
    };
    Ok((text, rest))
}

/// Decodes one binary-protocol parameter value given its type tag.
/// Returns the value and the bytes consumed to produce it (the temporal
/// branches read their own length prefix, so callers should not separately
/// advance for those).
pub fn decode_param_value<'a>(
    ty: ColumnType,
    unsigned: bool,
    data: &'a [u8],
) -> Result<(ParamValue, &'a [u8])> {
    use ColumnType::*;
    match ty {
        MYSQL_TYPE_TINY => {
            let (v, rest) = read_int_1(data)?;
            Ok((
                if unsigned {
                    ParamValue::Unsigned(v as u64)
                } else {
                    ParamValue::Signed(v as i8 as i64)
                },
                rest,
            ))
        }
        MYSQL_TYPE_SHORT | MYSQL_TYPE_YEAR => {
            let (v, rest) = read_int_2(data)?;
            Ok((
                if unsigned {
                    ParamValue::Unsigned(v as u64)
                } else {
                    ParamValue::Signed(v as i16 as i64)
                },
                rest,
            ))
        }
        MYSQL_TYPE_LONG | MYSQL_TYPE_INT24 => {
            let (v, rest) = read_int_4(data)?;
            Ok((
                if unsigned {
                    ParamValue::Unsigned(v as u64)
                } else {
                    ParamValue::Signed(v as i32 as i64)
                },
                rest,
            ))
        }
        MYSQL_TYPE_LONGLONG => {
            let (v, rest) = read_int_8(data)?;
            Ok((
                if unsigned {
                    ParamValue::Unsigned(v)
                } else {
                    ParamValue::Signed(v as i64)
                },
                rest,
            ))
        }
        MYSQL_TYPE_FLOAT => {
            let (v, rest) = read_int_4(data)?;
            Ok((ParamValue::Float(f32::from_bits(v) as f64), rest))
        }
        MYSQL_TYPE_DOUBLE => {
            let (v, rest) = read_int_8(data)?;
            Ok((ParamValue::Float(f64::from_bits(v)), rest))
        }
        MYSQL_TYPE_DECIMAL | MYSQL_TYPE_NEWDECIMAL => {
            let (s, rest) = read_string_lenenc(data)?;
            Ok((
                ParamValue::Decimal(String::from_utf8_lossy(s).into_owned()),
                rest,
            ))
        }
        MYSQL_TYPE_DATE | MYSQL_TYPE_NEWDATE => {
            let (s, rest) = decode_temporal_date_time(data)?;
            Ok((ParamValue::DateTime(s), rest))
        }
        MYSQL_TYPE_DATETIME | MYSQL_TYPE_TIMESTAMP | MYSQL_TYPE_DATETIME2
        | MYSQL_TYPE_TIMESTAMP2 => {
            let (s, rest) = decode_temporal_date_time(data)?;
            Ok((ParamValue::DateTime(s), rest))
        }
        MYSQL_TYPE_TIME | MYSQL_TYPE_TIME2 => {
            let (s, rest) = decode_temporal_time(data)?;
            Ok((ParamValue::DateTime(s), rest))
        }
        MYSQL_TYPE_VARCHAR | MYSQL_TYPE_VAR_STRING | MYSQL_TYPE_STRING | MYSQL_TYPE_ENUM
        | MYSQL_TYPE_SET | MYSQL_TYPE_JSON => {
            let (s, rest) = read_string_lenenc(data)?;
            Ok((
                ParamValue::Text(String::from_utf8_lossy(s).into_owned()),
                rest,
            ))
        }
        MYSQL_TYPE_BLOB | MYSQL_TYPE_TINY_BLOB | MYSQL_TYPE_MEDIUM_BLOB | MYSQL_TYPE_LONG_BLOB
        | MYSQL_TYPE_BIT | MYSQL_TYPE_GEOMETRY => {
            let (b, rest) = read_string_lenenc(data)?;
            Ok((ParamValue::Bytes(b.to_vec()), rest))
        }
        MYSQL_TYPE_NULL => Ok((ParamValue::Null, data)),
        MYSQL_TYPE_TYPED_ARRAY => Err(Error::Framing("typed array parameters unsupported")),
    }
}

/// Parses the 2-byte-per-parameter type block that follows the
/// `new-params-bound` flag when it is set.
pub fn decode_type_block(data: &[u8], num_params: usize) -> Result<(Vec<ParamType>, &[u8])> {
    let mut types = Vec::with_capacity(num_params);
    let mut rest = data;
    for _ in 0..num_params {
        let (tag, r) = read_int_1(rest)?;
        let (flag, r) = read_int_1(r)?;
        let ty = ColumnType::from_u8(tag).ok_or(Error::Framing("unknown parameter type"))?;
        types.push((ty, flag & 0x80 != 0));
        rest = r;
    }
    Ok((types, rest))
}

/// Decodes the full parameter section of a `COM_STMT_EXECUTE` packet:
/// null-bitmap, `new-params-bound` flag, optional type block, then each
/// non-null value. `cached_types` supplies the statement's previously
/// bound types when the flag is unset; the returned types should be
/// cached back onto the statement entry for subsequent executes.
pub fn decode_execute_params<'a>(
    num_params: usize,
    data: &'a [u8],
    cached_types: Option<&[ParamType]>,
) -> Result<(Vec<ParamValue>, Vec<ParamType>)> {
    decode_execute_params_with_long_data(num_params, data, cached_types, &std::collections::HashMap::new())
}

/// As [`decode_execute_params`], but for parameters previously streamed
/// via `COM_STMT_SEND_LONG_DATA`: the server excludes those values from
/// the execute packet's value section entirely (their null-bitmap bit
/// stays clear even though no bytes follow), so the buffered value is
/// spliced in and the value cursor is not advanced for that index.
pub fn decode_execute_params_with_long_data<'a>(
    num_params: usize,
    data: &'a [u8],
    cached_types: Option<&[ParamType]>,
    long_data: &std::collections::HashMap<u16, Vec<u8>>,
) -> Result<(Vec<ParamValue>, Vec<ParamType>)> {
    if num_params == 0 {
        return Ok((Vec::new(), Vec::new()));
    }

    let bitmap_len = num_params.div_ceil(8);
    let (bitmap, rest) = read_string_fix(data, bitmap_len)?;
    let (new_params_bound, rest) = read_int_1(rest)?;

    let (types, mut rest) = if new_params_bound != 0 {
        decode_type_block(rest, num_params)?
    } else {
        let types = cached_types
            .ok_or(Error::Framing("execute without cached parameter types"))?
            .to_vec();
        (types, rest)
    };

    if types.len() != num_params {
        return Err(Error::Framing("parameter type count mismatch"));
    }

    let mut values = Vec::with_capacity(num_params);
    for (i, (ty, unsigned)) in types.iter().enumerate() {
        if let Some(buffered) = long_data.get(&(i as u16)) {
            values.push(ParamValue::Bytes(buffered.clone()));
            continue;
        }
        let byte = bitmap[i / 8];
        let is_null = byte & (1 << (i % 8)) != 0;
        if is_null {
            values.push(ParamValue::Null);
            continue;
        }
        let (value, r) = decode_param_value(*ty, *unsigned, rest)?;
        values.push(value);
        rest = r;
    }

    Ok((values, types))
}

/// Encodes the null-bitmap + type block + values section for re-executing
/// a statement against the replay target, mirroring
/// [`decode_execute_params`] in the other direction.
pub fn encode_execute_params(out: &mut Vec<u8>, params: &[ParamValue]) {
    let bitmap_len = params.len().div_ceil(8);
    let start = out.len();
    out.resize(start + bitmap_len, 0);
    for (i, p) in params.iter().enumerate() {
        if p.is_null() {
            out[start + i / 8] |= 1 << (i % 8);
        }
    }

    write_int_1(out, 1); // new-params-bound always set on replay
    for p in params {
        write_param_type(out, p);
    }
    for p in params {
        if !p.is_null() {
            write_param_value(out, p);
        }
    }
}

fn write_param_type(out: &mut Vec<u8>, value: &ParamValue) {
    let (tag, unsigned) = match value {
        ParamValue::Null => (ColumnType::MYSQL_TYPE_VAR_STRING, false),
        ParamValue::Signed(_) => (ColumnType::MYSQL_TYPE_LONGLONG, false),
        ParamValue::Unsigned(_) => (ColumnType::MYSQL_TYPE_LONGLONG, true),
        ParamValue::Float(_) => (ColumnType::MYSQL_TYPE_DOUBLE, false),
        ParamValue::Decimal(_) => (ColumnType::MYSQL_TYPE_NEWDECIMAL, false),
        ParamValue::DateTime(_) => (ColumnType::MYSQL_TYPE_VAR_STRING, false),
        ParamValue::Bytes(_) => (ColumnType::MYSQL_TYPE_BLOB, false),
        ParamValue::Text(_) => (ColumnType::MYSQL_TYPE_VAR_STRING, false),
    };
    out.push(tag as u8);
    out.push(if unsigned { 0x80 } else { 0x00 });
}

fn write_param_value(out: &mut Vec<u8>, value: &ParamValue) {
    match value {
        ParamValue::Null => {}
        ParamValue::Signed(v) => write_int_8(out, *v as u64),
        ParamValue::Unsigned(v) => write_int_8(out, *v),
        ParamValue::Float(v) => write_int_8(out, v.to_bits()),
        ParamValue::Decimal(s) | ParamValue::DateTime(s) | ParamValue::Text(s) => {
            write_string_lenenc(out, s)
        }
        ParamValue::Bytes(b) => write_bytes_lenenc(out, b),
    }
}
