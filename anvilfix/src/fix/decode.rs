//! Message decoding and parsing.
//!
//! Frames come off the wire as a [`MsgBuf`] and have yet to be parsed or
//! verified. To extract tag/value pairs, walk the frame with [`parse`] and a
//! [`ParserCallback`]. The callback decides which tags it cares about,
//! implements how to interpret each value, and can either save the value or
//! return an error.
//!
//! [`MsgBuf`]: crate::fix::mem::MsgBuf

use crate::fix::fields::get_data_ref;
use crate::fix::fields::SessionRejectReason;
use crate::fix::{GarbledMessageType, SessionError};
use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

const TIME_FORMAT_SHORT: &str = "%Y%m%d-%H:%M:%S";
const TIME_FORMAT_LONG: &str = "%Y%m%d-%H:%M:%S%.3f";

/// The largest frame the engine will accept. A `BodyLength(9)` implying a
/// frame beyond this is treated as garbled input rather than an allocation
/// request.
pub const MAX_FRAME_LEN: usize = 1 << 20;

lazy_static! {
    static ref HEADER_FIELDS: BTreeSet<u32> = [
        8, 9, 35, 49, 56, 115, 128, 90, 91, 34, 50, 142, 57, 143, 116, 129, 145, 43, 97, 52, 122,
        212, 213, 347, 369, 370,
    ]
    .iter()
    .cloned()
    .collect();
    static ref TRAILER_FIELDS: BTreeSet<u32> = [93, 89, 10].iter().cloned().collect();
}

/// Errors from typed field conversions in [`fields`].
///
/// [`fields`]: crate::fix::fields
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("tag {0} is not part of the dictionary")]
    UnknownTag(u32),
    #[error("'{1}' is not a legal value for tag {0}")]
    UnknownChar(u32, char),
}

#[derive(PartialEq, Eq, Debug)]
enum FieldState {
    Start,
    InTag,
    SeenEquals,
    InField,
}

/// A trait that allows custom parsing of a [`MsgBuf`]
///
/// [`MsgBuf`]: crate::fix::mem::MsgBuf
pub trait ParserCallback<'a> {
    fn header(&mut self, key: u32, value: &'a [u8]) -> Result<bool, SessionError>;
    fn body(&mut self, key: u32, value: &'a [u8]) -> Result<bool, SessionError>;
    fn trailer(&mut self, key: u32, value: &'a [u8]) -> Result<bool, SessionError>;
    fn sequence_num(&self) -> u32;
}

/// A default implementation of [`ParserCallback`]
pub struct NullParserCallback;

impl<'a> ParserCallback<'a> for NullParserCallback {
    fn header(&mut self, _key: u32, _value: &'a [u8]) -> Result<bool, SessionError> {
        Ok(true)
    }
    fn body(&mut self, _key: u32, _value: &'a [u8]) -> Result<bool, SessionError> {
        Ok(true)
    }
    fn trailer(&mut self, _key: u32, _value: &'a [u8]) -> Result<bool, SessionError> {
        Ok(true)
    }
    fn sequence_num(&self) -> u32 {
        0
    }
}

/// Parse a [`MsgBuf`] with a [`ParserCallback`]
///
/// [`MsgBuf`]: crate::fix::mem::MsgBuf
pub fn parse<'a>(
    msg: &'a [u8],
    callbacks: &mut impl ParserCallback<'a>,
) -> Result<(), SessionError> {
    let mut field_lengths: HashMap<u32, u32> = HashMap::new();
    let mut state = FieldState::Start;
    let mut tag_accum: u32 = 0;
    let mut field_start: usize = 0;
    let mut iter = msg.iter().enumerate();
    while let Some((i, b)) = iter.next() {
        let c = *b as char;
        match (&state, c) {
            (&FieldState::Start, '0'..='9') | (&FieldState::InTag, '0'..='9') => {
                if state == FieldState::Start {
                    tag_accum = 0;
                } else {
                    tag_accum *= 10;
                }
                tag_accum += *b as u32 - '0' as u32;
                state = FieldState::InTag;
            }
            (&FieldState::InTag, '=') => {
                field_start = i + 1;
                if let Some(len) = field_lengths.get(&tag_accum) {
                    if *len > 0 {
                        skip_ahead(&mut iter, len - 1);
                    }
                }
                state = FieldState::SeenEquals;
            }
            (&FieldState::SeenEquals, '\x01') | (&FieldState::InField, '\x01') => {
                if let Some(tag) = get_data_ref(tag_accum) {
                    field_lengths.insert(
                        tag,
                        bytes_to_u32(&msg[field_start..i]).ok_or(
                            SessionError::new_message_rejected(
                                None,
                                Some(SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE),
                                callbacks.sequence_num(),
                                Some(tag_accum),
                                None,
                            ),
                        )?,
                    );
                }
                let cont =
                    if HEADER_FIELDS.contains(&tag_accum) || TRAILER_FIELDS.contains(&tag_accum) {
                        callbacks.header(tag_accum, &msg[field_start..i])?
                    } else {
                        callbacks.body(tag_accum, &msg[field_start..i])?
                    };
                if !cont {
                    break;
                }

                state = FieldState::Start;
            }
            (&FieldState::SeenEquals, _) | (&FieldState::InField, _) => {}
            _ => {
                return Err(SessionError::GarbledMessage {
                    text: format!("{}: invalid char at {} while in {:?}", c, i, state),
                    garbled_msg_type: GarbledMessageType::Other,
                });
            }
        }
    }
    Ok(())
}

fn bytes_to_u32(bytes: &[u8]) -> Option<u32> {
    let mut accum: u32 = 0;
    for b in bytes.iter() {
        if *b < b'0' || b'9' < *b {
            return None;
        }
        accum = match accum
            .checked_mul(10_u32)
            .and_then(|r| r.checked_add((b - b'0').into()))
        {
            Some(v) => v,
            _ => {
                return None;
            }
        }
    }
    Some(accum)
}

fn skip_ahead<T: Iterator>(iter: &mut T, n: u32) {
    for _ in 0..n {
        _ = iter.next();
    }
}

pub(super) struct ParsedPeek {
    /// Raw `MsgType(35)` bytes. Multi-byte values survive the peek so that
    /// unknown types can be rejected on the wire instead of dropping the
    /// frame.
    pub msg_type: Vec<u8>,
    pub msg_length: usize,
    pub len_start: usize,
    pub len_end: usize,
    pub fixed_fields_end: usize,
}

pub(super) fn parse_peeked_prefix(peeked: &[u8]) -> Result<ParsedPeek, SessionError> {
    const EXPECTED_PREFIX: &[u8] = b"8=FIX.4.4\x019=";
    if peeked.len() < EXPECTED_PREFIX.len() {
        return Err(SessionError::new_garbled_message(
            String::from("Frame shorter than the fixed header"),
            GarbledMessageType::Other,
        ));
    }
    if &peeked[..2] == b"8=" && &peeked[2..9] != b"FIX.4.4" {
        return Err(SessionError::new_garbled_message(
            String::from("Incorrect BeginString"),
            GarbledMessageType::BeginStringIssue,
        ));
    }

    if &peeked[..EXPECTED_PREFIX.len()] != EXPECTED_PREFIX {
        return Err(SessionError::new_garbled_message(
            String::from("BeginString not first"),
            GarbledMessageType::Other,
        ));
    }
    let mut at = EXPECTED_PREFIX.len();
    let mut body_length: usize = 0;
    let mut saw_end = false;
    for c in peeked[EXPECTED_PREFIX.len()..].iter() {
        at += 1;
        match *c as char {
            '0'..='9' => {
                body_length =
                    body_length
                        .checked_mul(10)
                        .ok_or(SessionError::new_garbled_message(
                            String::from("BodyLength too large"),
                            GarbledMessageType::BodyLengthIssue,
                        ))?;
                body_length = body_length.checked_add((*c - (b'0')) as usize).ok_or(
                    SessionError::new_garbled_message(
                        String::from("BodyLength too large"),
                        GarbledMessageType::BodyLengthIssue,
                    ),
                )?;
            }
            '\x01' => {
                saw_end = true;
                break;
            }
            _ => {
                return Err(SessionError::new_garbled_message(
                    String::from("Illegal character in BodyLength"),
                    GarbledMessageType::BodyLengthIssue,
                ));
            }
        }
    }
    let len_end = at - 1;
    if !saw_end {
        return Err(SessionError::new_garbled_message(
            String::from("BodyLength too large"),
            GarbledMessageType::BodyLengthIssue,
        ));
    }

    if peeked.len() < at + 4 || &peeked[at..at + 3] != b"35=" {
        return Err(SessionError::new_garbled_message(
            String::from("Missing MsgType"),
            GarbledMessageType::MsgTypeIssue,
        ));
    }
    let mut msg_type = Vec::with_capacity(2);
    let mut saw_type_end = false;
    for c in peeked[at + 3..].iter() {
        if *c == b'\x01' {
            saw_type_end = true;
            break;
        }
        msg_type.push(*c);
    }
    if !saw_type_end || msg_type.is_empty() {
        return Err(SessionError::new_garbled_message(
            String::from("MsgType missing or runs past the peeked prefix"),
            GarbledMessageType::MsgTypeIssue,
        ));
    }
    let fixed_fields_end = at + 3 + msg_type.len() + 1;

    // "at" is at the first character counted by BodyLength.
    // BodyLength counts all bytes up to and including the SOH before the
    // checksum, and the trailer 10=xxx| is always 7 bytes, so:
    //   at + body_length + 7 = total frame length
    let msg_length = body_length + at + 7;
    if msg_length > MAX_FRAME_LEN {
        return Err(SessionError::new_garbled_message(
            format!("BodyLength implies a {}-byte frame", msg_length),
            GarbledMessageType::BodyLengthIssue,
        ));
    }
    Ok(ParsedPeek {
        msg_type,
        msg_length,
        len_start: EXPECTED_PREFIX.len(),
        len_end,
        fixed_fields_end,
    })
}

/// Attempts to parse a FIX value into any type that `impl`'s [`FromStr`]
///
/// [`FromStr`]: std::str::FromStr
pub fn parse_field<T>(field: &[u8]) -> Result<T>
where
    T: std::str::FromStr,
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::str::from_utf8(field)?
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{e:?}"))
}

pub(super) fn parse_sending_time(sending_time_bytes: &[u8]) -> Result<DateTime<Utc>> {
    let sending_time_str = std::str::from_utf8(sending_time_bytes)?;
    let sending_time = NaiveDateTime::parse_from_str(sending_time_str, TIME_FORMAT_SHORT).or(
        NaiveDateTime::parse_from_str(sending_time_str, TIME_FORMAT_LONG),
    )?;
    Ok(sending_time.and_utc())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_peeked_prefix() {
        let p = parse_peeked_prefix(b"8=FIX.4.4\x019=57\x0135=A\x0134=1\x0149=ISLD\x01").unwrap();
        assert_eq!(p.msg_type, b"A".to_vec());
        assert_eq!(p.len_start, 12);
        assert_eq!(p.len_end, 14);
        // prefix is 15 bytes, so 15 + 57 + 7
        assert_eq!(p.msg_length, 79);
        assert_eq!(p.fixed_fields_end, 20);
    }

    #[test]
    fn test_peeked_prefix_multibyte_msg_type() {
        let p = parse_peeked_prefix(b"8=FIX.4.4\x019=90\x0135=BAD\x0134=2\x0149=C\x01").unwrap();
        assert_eq!(p.msg_type, b"BAD".to_vec());
        assert_eq!(p.msg_length, 90 + 15 + 7);
    }

    #[test]
    fn test_peeked_prefix_errors() {
        assert!(matches!(
            parse_peeked_prefix(b"8=FIX.4.2\x019=57\x0135=A\x0134=1\x0149=ISLD\x01"),
            Err(SessionError::GarbledMessage {
                garbled_msg_type: GarbledMessageType::BeginStringIssue,
                ..
            })
        ));
        assert!(matches!(
            parse_peeked_prefix(b"8=FIX.4.4\x019=33333333333333333333333"),
            Err(SessionError::GarbledMessage {
                garbled_msg_type: GarbledMessageType::BodyLengthIssue,
                ..
            })
        ));
        assert!(matches!(
            parse_peeked_prefix(b"8=FIX.4.4\x019=5x\x0135=A\x0134=1\x0149=ISLD\x01"),
            Err(SessionError::GarbledMessage {
                garbled_msg_type: GarbledMessageType::BodyLengthIssue,
                ..
            })
        ));
        assert!(matches!(
            parse_peeked_prefix(b"8=FIX.4.4\x019=57\x0134=1\x0135=A\x0149=ISLD\x01"),
            Err(SessionError::GarbledMessage {
                garbled_msg_type: GarbledMessageType::MsgTypeIssue,
                ..
            })
        ));
        // 2_000_000-byte body blows the frame cap
        assert!(matches!(
            parse_peeked_prefix(b"8=FIX.4.4\x019=2000000\x0135=A\x0134=1\x0149=I\x01"),
            Err(SessionError::GarbledMessage {
                garbled_msg_type: GarbledMessageType::BodyLengthIssue,
                ..
            })
        ));
    }

    #[test]
    fn test_parse_routes_data_fields() {
        struct Collect {
            raw_data: Option<Vec<u8>>,
        }
        impl<'a> ParserCallback<'a> for Collect {
            fn header(&mut self, _k: u32, _v: &'a [u8]) -> Result<bool, SessionError> {
                Ok(true)
            }
            fn body(&mut self, k: u32, v: &'a [u8]) -> Result<bool, SessionError> {
                if k == 96 {
                    self.raw_data = Some(v.to_vec());
                }
                Ok(true)
            }
            fn trailer(&mut self, _k: u32, _v: &'a [u8]) -> Result<bool, SessionError> {
                Ok(false)
            }
            fn sequence_num(&self) -> u32 {
                0
            }
        }
        // RawData contains an embedded SOH; the declared length must carry
        // the parser across it.
        let mut cb = Collect { raw_data: None };
        let msg = b"8=FIX.4.4\x019=21\x0195=7\x0196=12\x014\x0167\x0110=000\x01";
        parse(&msg[..], &mut cb).unwrap();
        assert_eq!(cb.raw_data, Some(b"12\x014\x0167".to_vec()));

        let mut cb = Collect { raw_data: None };
        let bad_len = b"8=FIX.4.4\x019=21\x0195=1a\x0196=123\x01456789\x0110=000\x01";
        assert!(parse(&bad_len[..], &mut cb).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let mut cb = NullParserCallback;
        assert!(parse(&b"8=FIX.4.4\x01x9=21\x0110=000\x01"[..], &mut cb).is_err());
    }

    #[test]
    fn test_bytes_to_u32() {
        assert_eq!(bytes_to_u32(b"234").unwrap(), 234);
        assert_eq!(bytes_to_u32(b"0").unwrap(), 0);
        assert_eq!(
            bytes_to_u32(b"11111111111111111111111111111111111111").is_none(),
            true
        );
        assert_eq!(bytes_to_u32(b"a").is_none(), true);
    }

    #[test]
    fn test_parse_sending_time() {
        assert!(parse_sending_time(b"20240506-13:59:15.021").is_ok());
        assert!(parse_sending_time(b"20240506-13:59:15").is_ok());
        assert!(parse_sending_time(b"2024-05-06 13:59").is_err());
    }
}
