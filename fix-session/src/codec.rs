//! Wire codec: encodes a `FixMessage` to SOH-delimited bytes and
//! incrementally decodes one or more messages from an append-only buffer.
//!
//! The incremental parser is built on `nom`'s streaming combinators, the
//! same approach the tag=value framing originally used: partial input
//! yields `Ok(None)` rather than an error, and `get_message` can be called
//! repeatedly as more bytes arrive.

use fix_core::{tags, CodecError, FixMessage, FixStr, FixString, Header, MsgType, SeqNum, Tag, Uid, UtcTimestamp};
use nom::{
    bytes::streaming::{tag, take_until},
    character::streaming::u8 as nom_u8,
    combinator::{consumed, verify},
    multi::{length_data, many0},
    sequence::{delimited, separated_pair, terminated, tuple},
    IResult,
};

fn verify_fix_bytes(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| (0x20..=0x7e).contains(&b))
}

fn generic_field(i: &[u8]) -> IResult<&[u8], (Tag, &[u8])> {
    terminated(
        separated_pair(nom::character::streaming::u16, tag("="), take_until("\x01")),
        tag("\x01"),
    )(i)
}

fn begin_string(i: &[u8]) -> IResult<&[u8], &[u8]> {
    delimited(tag("8="), verify(take_until("\x01"), verify_fix_bytes), tag("\x01"))(i)
}

fn body_length(i: &[u8]) -> IResult<&[u8], u16> {
    delimited(tag("9="), nom::character::streaming::u16, tag("\x01"))(i)
}

fn checksum_field(i: &[u8]) -> IResult<&[u8], u8> {
    delimited(tag("10="), nom_u8, tag("\x01"))(i)
}

struct Framed<'a> {
    /// Bytes from the start of BeginString up to (not including) the
    /// CheckSum field — exactly what CheckSum is computed over.
    signed_span: &'a [u8],
    begin_string: &'a [u8],
    body: &'a [u8],
    checksum: u8,
}

fn framed_message(i: &[u8]) -> IResult<&[u8], Framed<'_>> {
    let (i, (signed_span, (begin_string, body))) =
        consumed(tuple((begin_string, length_data(body_length))))(i)?;
    let (i, checksum) = checksum_field(i)?;
    Ok((
        i,
        Framed { signed_span, begin_string, body, checksum },
    ))
}

fn compute_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u32, |acc, &b| acc + b as u32) as u8
}

fn decode_body(body: &[u8]) -> Result<(Header, Vec<(Tag, FixString)>), CodecError> {
    let (leftover, fields) =
        many0(generic_field)(body).map_err(|_| CodecError::MalformedField { offset: 0 })?;
    if !leftover.is_empty() {
        return Err(CodecError::MalformedField { offset: body.len() - leftover.len() });
    }

    let mut header = Header {
        begin_string: FixString::new(),
        body_length: 0,
        msg_type: None,
        msg_seq_num: None,
        sender_comp_id: None,
        target_comp_id: None,
        sending_time: None,
        poss_dup_flag: false,
        orig_sending_time: None,
    };
    let mut rest = Vec::with_capacity(fields.len());

    for (offset, (raw_tag, raw_value)) in fields.into_iter().enumerate() {
        let value = FixStr::from_ascii(raw_value)
            .map_err(|_| CodecError::InvalidFieldValue { offset })?;
        match raw_tag {
            tags::MSG_TYPE if header.msg_type.is_none() => {
                header.msg_type = Some(MsgType::from_fix_str(value));
            }
            tags::MSG_SEQ_NUM if header.msg_seq_num.is_none() => {
                let n: SeqNum = value
                    .as_utf8()
                    .parse()
                    .map_err(|_| CodecError::InvalidFieldValue { offset })?;
                header.msg_seq_num = Some(n);
            }
            tags::SENDER_COMP_ID if header.sender_comp_id.is_none() => {
                header.sender_comp_id = Some(value.to_owned());
            }
            tags::TARGET_COMP_ID if header.target_comp_id.is_none() => {
                header.target_comp_id = Some(value.to_owned());
            }
            tags::SENDING_TIME if header.sending_time.is_none() => {
                header.sending_time = UtcTimestamp::parse(value).ok();
            }
            tags::POSS_DUP_FLAG => {
                header.poss_dup_flag = value.as_utf8() == "Y";
            }
            tags::ORIG_SENDING_TIME => {
                header.orig_sending_time = UtcTimestamp::parse(value).ok();
            }
            _ => rest.push((raw_tag, value.to_owned())),
        }
    }

    Ok((header, rest))
}

/// Decodes exactly one framed message from `input`, verifying BeginString
/// bytes are printable and CheckSum matches. `uid` is assigned by the
/// caller (the store, typically) since framing alone carries no identity.
///
/// Returns `Ok(None)` when `input` does not yet hold a complete frame —
/// this is never an error, per the codec's partial-buffer contract. A
/// genuinely malformed frame (bad checksum, unparseable field) is `Err`.
pub fn decode(input: &[u8], uid: Uid) -> Result<Option<(usize, FixMessage)>, CodecError> {
    let (rest, framed) = match framed_message(input) {
        Ok(framed) => framed,
        Err(nom::Err::Incomplete(_)) => return Ok(None),
        Err(_) => return Err(CodecError::MissingBeginString),
    };

    let computed = compute_checksum(framed.signed_span);
    if computed != framed.checksum {
        return Err(CodecError::ChecksumMismatch { expected: framed.checksum, computed });
    }

    let begin_string = FixString::try_from(
        std::str::from_utf8(framed.begin_string).map_err(|_| CodecError::MissingBeginString)?,
    )
    .map_err(|_| CodecError::MissingBeginString)?;

    let (mut header, body) = decode_body(framed.body)?;
    header.begin_string = begin_string;
    header.body_length = framed.body.len() as u32;

    let consumed_len = input.len() - rest.len();
    Ok(Some((consumed_len, FixMessage { uid, header, body })))
}

fn push_field(out: &mut Vec<u8>, tag: Tag, value: &str) {
    out.extend_from_slice(tag.to_string().as_bytes());
    out.push(b'=');
    out.extend_from_slice(value.as_bytes());
    out.push(0x01);
}

/// Encodes a message in header order `{8, 9, 35, 34, 49, 56, 52, [43],
/// [122], ...body}` followed by the computed CheckSum. Panics if any
/// required header field is unset — callers populate the header (via
/// `fill`) before encoding.
pub fn encode(header: &Header, body: &[(Tag, FixString)]) -> Vec<u8> {
    let mut core = Vec::new();
    push_field(
        &mut core,
        tags::MSG_TYPE,
        header.msg_type.as_ref().expect("MsgType set before encode").as_fix_str(),
    );
    push_field(
        &mut core,
        tags::MSG_SEQ_NUM,
        &header.msg_seq_num.expect("MsgSeqNum set before encode").to_string(),
    );
    push_field(
        &mut core,
        tags::SENDER_COMP_ID,
        header.sender_comp_id.as_ref().expect("SenderCompID set before encode").as_utf8(),
    );
    push_field(
        &mut core,
        tags::TARGET_COMP_ID,
        header.target_comp_id.as_ref().expect("TargetCompID set before encode").as_utf8(),
    );
    push_field(
        &mut core,
        tags::SENDING_TIME,
        &header.sending_time.expect("SendingTime set before encode").to_string(),
    );
    if header.poss_dup_flag {
        push_field(&mut core, tags::POSS_DUP_FLAG, "Y");
    }
    if let Some(orig) = header.orig_sending_time {
        push_field(&mut core, tags::ORIG_SENDING_TIME, &orig.to_string());
    }
    for (tag, value) in body {
        push_field(&mut core, *tag, value.as_utf8());
    }

    let mut out = Vec::with_capacity(core.len() + 32);
    push_field(&mut out, tags::BEGIN_STRING, header.begin_string.as_utf8());
    push_field(&mut out, tags::BODY_LENGTH, &core.len().to_string());
    out.extend_from_slice(&core);
    let checksum = compute_checksum(&out);
    push_field(&mut out, tags::CHECK_SUM, &format!("{checksum:03}"));
    out
}

/// Stateful incremental decoder over an append-only byte stream. Malformed
/// framing (bad checksum) discards the offending bytes and resynchronizes
/// on the next `8=`; genuinely partial input just waits for more bytes.
#[derive(Default)]
pub struct Codec {
    buffer: Vec<u8>,
    next_uid: u64,
}

impl Codec {
    pub fn new() -> Codec {
        Codec::default()
    }

    pub fn append_buffer(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the next complete message if one is buffered. On a malformed
    /// frame, discards the offending bytes up through the next `8=` so the
    /// stream can resynchronize, and returns the error for that span.
    pub fn get_message(&mut self) -> Result<Option<FixMessage>, CodecError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        self.next_uid += 1;
        match decode(&self.buffer, Uid::new(self.next_uid)) {
            Ok(Some((consumed, msg))) => {
                self.buffer.drain(..consumed);
                Ok(Some(msg))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.resync();
                Err(e)
            }
        }
    }

    fn resync(&mut self) {
        // Skip past byte 0: the failed frame itself starts with `8=`, so
        // searching from the start would just find it again and make no
        // progress. Look for the *next* occurrence instead.
        if let Some(pos) = self.buffer[1..].windows(2).position(|w| w == b"8=") {
            self.buffer.drain(..pos + 1);
        } else {
            self.buffer.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            begin_string: FixString::try_from("FIX.4.2").unwrap(),
            body_length: 0,
            msg_type: Some(MsgType::Logon),
            msg_seq_num: Some(1),
            sender_comp_id: Some(FixString::try_from("BUYER").unwrap()),
            target_comp_id: Some(FixString::try_from("SELLER").unwrap()),
            sending_time: Some(UtcTimestamp::parse(&FixString::try_from("20240102-03:04:05.123456").unwrap()).unwrap()),
            poss_dup_flag: false,
            orig_sending_time: None,
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let header = sample_header();
        let body = vec![(108u16, FixString::try_from("30").unwrap())];
        let bytes = encode(&header, &body);

        let (consumed, msg) = decode(&bytes, Uid::new(1)).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(msg.header.msg_seq_num, Some(1));
        assert_eq!(msg.header.sender_comp_id.unwrap().as_utf8(), "BUYER");
        assert_eq!(msg.get(108).unwrap().as_utf8(), "30");
    }

    #[test]
    fn detects_checksum_mismatch() {
        let header = sample_header();
        let mut bytes = encode(&header, &[]);
        let last_digit = bytes.len() - 2;
        bytes[last_digit] = if bytes[last_digit] == b'0' { b'1' } else { b'0' };
        assert!(matches!(decode(&bytes, Uid::new(1)), Err(CodecError::ChecksumMismatch { .. })));
    }

    #[test]
    fn incremental_codec_waits_for_full_message() {
        let header = sample_header();
        let bytes = encode(&header, &[]);
        let mut codec = Codec::new();
        codec.append_buffer(&bytes[..bytes.len() - 5]);
        assert!(codec.get_message().unwrap().is_none());
        codec.append_buffer(&bytes[bytes.len() - 5..]);
        assert!(codec.get_message().unwrap().is_some());
    }

    #[test]
    fn codec_resynchronizes_after_bad_checksum() {
        let header = sample_header();
        let mut bytes = encode(&header, &[]);
        let last_digit = bytes.len() - 2;
        bytes[last_digit] = if bytes[last_digit] == b'0' { b'1' } else { b'0' };
        bytes.extend_from_slice(&encode(&header, &[]));

        let mut codec = Codec::new();
        codec.append_buffer(&bytes);
        assert!(codec.get_message().is_err());
        assert!(codec.get_message().unwrap().is_some());
    }
}
