//! Field parsers for the header-matched modem responses.
//!
//! The conversation engine accumulates a full line first; these parsers only
//! ever see a complete line and turn it into typed fields. Headers are
//! located anywhere in the line because the modem is free to prepend echo or
//! blank padding.

use winnow::ascii::space0;
use winnow::combinator::preceded;
use winnow::token::take_while;
use winnow::{ModalResult, Parser};

/// Fields of a session-initiate (`+SBDIX:`) response.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SessionFields<'a> {
    pub mo_status: u16,
    pub momsn: &'a str,
    pub mt_status: u8,
    pub mtmsn: &'a str,
    pub mt_length: u16,
    pub queued: u8,
}

/// Fields of a gateway-status (`+SBDSX:`) response.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GatewayFields<'a> {
    pub mo_flag: u8,
    pub momsn: &'a str,
    pub mt_flag: u8,
    pub mtmsn: &'a str,
    pub ring_alert: u8,
    pub queued: u8,
}

fn number<'s>(input: &mut &'s str) -> ModalResult<&'s str> {
    preceded(
        space0,
        take_while(1.., |c: char| c.is_ascii_digit() || c == '-'),
    )
    .parse_next(input)
}

fn comma_number<'s>(input: &mut &'s str) -> ModalResult<&'s str> {
    preceded((space0, ','), number).parse_next(input)
}

fn after_header<'s>(line: &'s str, header: &str) -> Option<&'s str> {
    let start = line.find(header)?;
    Some(&line[start + header.len()..])
}

fn six_fields<'s>(rest: &'s str) -> Option<[&'s str; 6]> {
    let mut input = rest;
    let (a, b, c, d, e, f) = (
        number,
        comma_number,
        comma_number,
        comma_number,
        comma_number,
        comma_number,
    )
        .parse_next(&mut input)
        .ok()?;
    Some([a, b, c, d, e, f])
}

/// Parses a `+SBDIX:` line. `None` until the header and all six fields are
/// present.
pub fn session(line: &str) -> Option<SessionFields<'_>> {
    let fields = six_fields(after_header(line, "+SBDIX:")?)?;
    Some(SessionFields {
        mo_status: fields[0].parse().ok()?,
        momsn: fields[1],
        mt_status: fields[2].parse().ok()?,
        mtmsn: fields[3],
        mt_length: fields[4].parse().unwrap_or(0),
        queued: fields[5].parse().unwrap_or(0),
    })
}

/// Parses a `+SBDSX:` line.
pub fn gateway(line: &str) -> Option<GatewayFields<'_>> {
    let fields = six_fields(after_header(line, "+SBDSX:")?)?;
    Some(GatewayFields {
        mo_flag: fields[0].parse().ok()?,
        momsn: fields[1],
        mt_flag: fields[2].parse().unwrap_or(0),
        mtmsn: fields[3],
        ring_alert: fields[4].parse().ok()?,
        queued: fields[5].parse().unwrap_or(0),
    })
}

/// Parses a `+CREG:setting,status` line into the status field.
pub fn registration(line: &str) -> Option<u8> {
    let mut input = after_header(line, "+CREG:")?;
    let (_setting, status) = (number, comma_number).parse_next(&mut input).ok()?;
    status.parse().ok()
}

/// Parses a `+CSQF:n` line into the signal level.
pub fn signal_quality(line: &str) -> Option<u8> {
    let mut input = after_header(line, "+CSQF:")?;
    number.parse_next(&mut input).ok()?.parse().ok()
}

/// Parses a `+CLCC:nnn` line into the raw call-status code.
pub fn call_status(line: &str) -> Option<u8> {
    let mut input = after_header(line, "+CLCC:")?;
    number.parse_next(&mut input).ok()?.parse().ok()
}

/// Extracts the software version that follows the revision banner.
pub fn revision(line: &str) -> Option<&str> {
    let rest = after_header(line, "Call Processor Version: ")?;
    let end = rest
        .char_indices()
        .find(|(_, c)| *c == '\r' || *c == '\n')
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    Some(&rest[..end])
}
