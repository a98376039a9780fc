//! The canonical, serializable record of one protocol-level action:
//! textual, tab-separated, one event per line. Binary-unsafe fields (SQL
//! text, parameter payloads) are escaped or hex-encoded so a line never
//! contains a literal tab or newline other than the ones that separate
//! fields and records.
//!
//! `decode(encode(e)) == e` is a hard guarantee relied on by the replay
//! scanner and exercised directly in the tests below.

use crate::error::{Error, Result};
use crate::wire::value::ParamValue;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Handshake { schema: String },
    Quit,
    Query { sql: String },
    StmtPrepare { statement_id: u32, num_params: u16, sql: String },
    StmtExecute { statement_id: u32, params: Vec<ParamValue> },
    StmtClose { statement_id: u32 },
}

impl Event {
    fn kind_tag(&self) -> &'static str {
        match self {
            Event::Handshake { .. } => "HANDSHAKE",
            Event::Quit => "QUIT",
            Event::Query { .. } => "QUERY",
            Event::StmtPrepare { .. } => "STMT_PREPARE",
            Event::StmtExecute { .. } => "STMT_EXECUTE",
            Event::StmtClose { .. } => "STMT_CLOSE",
        }
    }
}

/// Escapes `\`, tab, CR and LF so the result can sit inside one
/// tab-separated field without introducing a stray field or line break.
fn escape_field(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_field(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            _ => return Err(Error::EventCodec("dangling escape in field".into())),
        }
    }
    Ok(out)
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::EventCodec("odd-length hex field".into()));
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for chunk in bytes.chunks(2) {
        let hi = (chunk[0] as char).to_digit(16).ok_or_else(|| Error::EventCodec("bad hex digit".into()))?;
        let lo = (chunk[1] as char).to_digit(16).ok_or_else(|| Error::EventCodec("bad hex digit".into()))?;
        out.push(((hi << 4) | lo) as u8);
    }
    Ok(out)
}

fn param_tag(value: &ParamValue) -> char {
    match value {
        ParamValue::Null => 'N',
        ParamValue::Signed(_) => 'S',
        ParamValue::Unsigned(_) => 'U',
        ParamValue::Float(_) => 'F',
        ParamValue::Decimal(_) => 'D',
        ParamValue::DateTime(_) => 'T',
        ParamValue::Bytes(_) => 'B',
        ParamValue::Text(_) => 'X',
    }
}

fn param_raw_bytes(value: &ParamValue) -> Vec<u8> {
    match value {
        ParamValue::Null => Vec::new(),
        ParamValue::Signed(i) => i.to_string().into_bytes(),
        ParamValue::Unsigned(u) => u.to_string().into_bytes(),
        ParamValue::Float(f) => f.to_bits().to_be_bytes().to_vec(),
        ParamValue::Decimal(s) | ParamValue::DateTime(s) | ParamValue::Text(s) => {
            s.clone().into_bytes()
        }
        ParamValue::Bytes(b) => b.clone(),
    }
}

fn encode_param(value: &ParamValue) -> String {
    format!("{}{}", param_tag(value), encode_hex(&param_raw_bytes(value)))
}

fn decode_param(field: &str) -> Result<ParamValue> {
    let mut chars = field.chars();
    let tag = chars
        .next()
        .ok_or_else(|| Error::EventCodec("empty parameter field".into()))?;
    let raw = decode_hex(chars.as_str())?;

    let as_string = || {
        String::from_utf8(raw.clone()).map_err(|_| Error::EventCodec("non-utf8 parameter text".into()))
    };

    Ok(match tag {
        'N' => ParamValue::Null,
        'S' => ParamValue::Signed(
            as_string()?
                .parse()
                .map_err(|_| Error::EventCodec("bad signed parameter".into()))?,
        ),
        'U' => ParamValue::Unsigned(
            as_string()?
                .parse()
                .map_err(|_| Error::EventCodec("bad unsigned parameter".into()))?,
        ),
        'F' => {
            if raw.len() != 8 {
                return Err(Error::EventCodec("bad float parameter width".into()));
            }
            let mut bits = [0u8; 8];
            bits.copy_from_slice(&raw);
            ParamValue::Float(f64::from_bits(u64::from_be_bytes(bits)))
        }
        'D' => ParamValue::Decimal(as_string()?),
        'T' => ParamValue::DateTime(as_string()?),
        'B' => ParamValue::Bytes(raw),
        'X' => ParamValue::Text(as_string()?),
        other => return Err(Error::EventCodec(format!("unknown parameter tag '{other}'"))),
    })
}

fn encode_params(params: &[ParamValue]) -> String {
    params.iter().map(encode_param).collect::<Vec<_>>().join(",")
}

fn decode_params(field: &str) -> Result<Vec<ParamValue>> {
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field.split(',').map(decode_param).collect()
}

pub fn encode_event(ts_ms: i64, event: &Event) -> String {
    let mut fields = vec![ts_ms.to_string(), event.kind_tag().to_string()];
    match event {
        Event::Handshake { schema } => fields.push(escape_field(schema)),
        Event::Quit => {}
        Event::Query { sql } => fields.push(escape_field(sql)),
        Event::StmtPrepare { statement_id, num_params, sql } => {
            fields.push(statement_id.to_string());
            fields.push(num_params.to_string());
            fields.push(escape_field(sql));
        }
        Event::StmtExecute { statement_id, params } => {
            fields.push(statement_id.to_string());
            fields.push(encode_params(params));
        }
        Event::StmtClose { statement_id } => fields.push(statement_id.to_string()),
    }
    fields.join("\t")
}

pub fn decode_event(line: &str) -> Result<(i64, Event)> {
    let mut fields = line.split('\t');
    let ts_ms: i64 = fields
        .next()
        .ok_or_else(|| Error::EventCodec("missing timestamp field".into()))?
        .parse()
        .map_err(|_| Error::EventCodec("bad timestamp field".into()))?;
    let kind = fields
        .next()
        .ok_or_else(|| Error::EventCodec("missing event type field".into()))?;

    let event = match kind {
        "HANDSHAKE" => Event::Handshake {
            schema: unescape_field(next_field(&mut fields)?)?,
        },
        "QUIT" => Event::Quit,
        "QUERY" => Event::Query {
            sql: unescape_field(next_field(&mut fields)?)?,
        },
        "STMT_PREPARE" => {
            let statement_id = parse_field(next_field(&mut fields)?)?;
            let num_params = parse_field(next_field(&mut fields)?)?;
            let sql = unescape_field(next_field(&mut fields)?)?;
            Event::StmtPrepare { statement_id, num_params, sql }
        }
        "STMT_EXECUTE" => {
            let statement_id = parse_field(next_field(&mut fields)?)?;
            let params = decode_params(next_field(&mut fields)?)?;
            Event::StmtExecute { statement_id, params }
        }
        "STMT_CLOSE" => {
            let statement_id = parse_field(next_field(&mut fields)?)?;
            Event::StmtClose { statement_id }
        }
        other => return Err(Error::EventCodec(format!("unknown event type '{other}'"))),
    };

    Ok((ts_ms, event))
}

fn next_field<'a>(fields: &mut impl Iterator<Item = &'a str>) -> Result<&'a str> {
    fields.next().ok_or_else(|| Error::EventCodec("missing field".into()))
}

fn parse_field<T: std::str::FromStr>(field: &str) -> Result<T> {
    field.parse().map_err(|_| Error::EventCodec(format!("bad numeric field '{field}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(ts: i64, event: Event) {
        let line = encode_event(ts, &event);
        assert!(!line.contains('\n'));
        let (decoded_ts, decoded_event) = decode_event(&line).unwrap();
        assert_eq!(decoded_ts, ts);
        assert_eq!(decoded_event, event);
    }

    #[test]
    fn handshake_roundtrips_with_embedded_tab_and_backslash() {
        roundtrip(
            1000,
            Event::Handshake {
                schema: "weird\tschema\\name".into(),
            },
        );
    }

    #[test]
    fn quit_roundtrips() {
        roundtrip(2000, Event::Quit);
    }

    #[test]
    fn query_with_newline_roundtrips() {
        roundtrip(
            3000,
            Event::Query {
                sql: "SELECT *\nFROM t WHERE x = 'a\\b'".into(),
            },
        );
    }

    #[test]
    fn stmt_prepare_roundtrips() {
        roundtrip(
            4000,
            Event::StmtPrepare {
                statement_id: 7,
                num_params: 2,
                sql: "SELECT * FROM t WHERE a = ? AND b = ?".into(),
            },
        );
    }

    #[test]
    fn stmt_execute_with_mixed_params_roundtrips() {
        roundtrip(
            5000,
            Event::StmtExecute {
                statement_id: 7,
                params: vec![
                    ParamValue::Null,
                    ParamValue::Signed(-42),
                    ParamValue::Unsigned(42),
                    ParamValue::Float(3.5),
                    ParamValue::Bytes(vec![0, 1, 2, 0xff]),
                    ParamValue::Text("hi,there".into()),
                ],
            },
        );
    }

    #[test]
    fn stmt_close_roundtrips() {
        roundtrip(6000, Event::StmtClose { statement_id: 7 });
    }

    #[test]
    fn unknown_event_type_is_an_error() {
        assert!(decode_event("1\tBOGUS").is_err());
    }
}
