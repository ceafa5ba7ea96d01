use std::fmt::{self, Display};

use nom::{
    branch::alt,
    bytes::complete::take_while1,
    character::complete::char,
    combinator::map,
    error::{ErrorKind, ParseError},
    multi::{separated_list0, separated_list1},
    sequence::{delimited, separated_pair},
    IResult, Parser,
};
use serde::Serialize;
use tracing::trace;

use crate::{
    raw::{escape, List, MiFormatter, ResultEntry, Tuple, Value},
    Token,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RecordKind {
    Result,
    StatusAsync,
    ExecAsync,
    NotifyAsync,
    ConsoleStream,
    TargetStream,
    LogStream,
    /// `?`, echoed by some gdb builds. Carries nothing.
    Query,
    Unknown,
}

impl RecordKind {
    pub fn from_char(c: char) -> Self {
        match c {
            '^' => Self::Result,
            '+' => Self::StatusAsync,
            '*' => Self::ExecAsync,
            '=' => Self::NotifyAsync,
            '~' => Self::ConsoleStream,
            '@' => Self::TargetStream,
            '&' => Self::LogStream,
            '?' => Self::Query,
            _ => Self::Unknown,
        }
    }

    pub fn type_char(&self) -> Option<char> {
        match self {
            Self::Result => Some('^'),
            Self::StatusAsync => Some('+'),
            Self::ExecAsync => Some('*'),
            Self::NotifyAsync => Some('='),
            Self::ConsoleStream => Some('~'),
            Self::TargetStream => Some('@'),
            Self::LogStream => Some('&'),
            Self::Query => Some('?'),
            Self::Unknown => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            Self::ConsoleStream | Self::TargetStream | Self::LogStream
        )
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::StatusAsync | Self::ExecAsync | Self::NotifyAsync)
    }
}

/// One parsed line of MI output.
///
/// Parsing never fails outright. When the line stops matching the grammar
/// part-way, the record keeps whatever was decoded before that point and
/// [`Record::error`] describes where decoding stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    token: Option<Token>,
    kind: RecordKind,
    class: String,
    results: Tuple,
    stream: Option<String>,
    error: Option<String>,
}

impl Record {
    fn new(token: Option<Token>, kind: RecordKind) -> Self {
        Self {
            token,
            kind,
            class: String::new(),
            results: Tuple::new(),
            stream: None,
            error: None,
        }
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn type_char(&self) -> Option<char> {
        self.kind.type_char()
    }

    pub fn is_stream(&self) -> bool {
        self.kind.is_stream()
    }

    /// Unescaped payload of a stream record.
    pub fn stream(&self) -> Option<&str> {
        self.stream.as_deref()
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn results(&self) -> &Tuple {
        &self.results
    }

    pub fn into_results(self) -> Tuple {
        self.results
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// A non-stream record that carried no results, e.g. a bare `^done`.
    /// gdb answers some failed console commands this way, with the reason
    /// only on the log stream.
    pub fn is_empty(&self) -> bool {
        !self.is_stream() && self.results.is_empty()
    }

    fn fail(&mut self, message: String) {
        // keep the first complaint, later ones are usually fallout
        if self.error.is_none() {
            self.error = Some(message);
        }
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(token) = self.token {
            write!(f, "{}", token)?;
        }
        if let Some(c) = self.type_char() {
            write!(f, "{}", c)?;
        }
        if let Some(stream) = &self.stream {
            return f.write_str(&escape(stream));
        }
        f.write_str(&self.class)?;
        if !self.results.is_empty() {
            write!(f, ",{}", MiFormatter::format_results(&self.results.0))?;
        }
        Ok(())
    }
}

/// Parse one line of MI output. Total over any input.
pub fn parse_record(line: &str) -> Record {
    let line = line.trim_end_matches(['\r', '\n']);

    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    let (token_str, rest) = line.split_at(digits);
    let parsed = (!token_str.is_empty()).then(|| token_str.parse::<u64>());
    // 0 is never issued, so it reads as "no token"
    let token = match parsed {
        Some(Ok(0)) | Some(Err(_)) | None => None,
        Some(Ok(n)) => Some(Token(n)),
    };

    let mut chars = rest.chars();
    let Some(type_char) = chars.next() else {
        let mut record = Record::new(token, RecordKind::Unknown);
        record.fail(if line.is_empty() {
            "empty line".to_owned()
        } else {
            format!("missing record type after token at column {}", digits + 1)
        });
        return record;
    };
    let body = chars.as_str();
    let kind = RecordKind::from_char(type_char);
    let mut record = Record::new(token, kind);

    if matches!(parsed, Some(Err(_))) {
        record.fail(format!("token {} is out of range", token_str));
    }

    match kind {
        RecordKind::Unknown => {
            record.fail(format!(
                "unrecognized record type {:?} at column {}",
                type_char,
                digits + 1
            ));
        }
        RecordKind::Query => {}
        RecordKind::ConsoleStream | RecordKind::TargetStream | RecordKind::LogStream => {
            parse_stream(line, body, &mut record);
        }
        RecordKind::Result
        | RecordKind::StatusAsync
        | RecordKind::ExecAsync
        | RecordKind::NotifyAsync => {
            parse_class_and_results(line, body, &mut record);
        }
    }

    trace!("parsed record: {:?}", record);
    record
}

/// Parse every non-blank line of `output`, skipping prompt lines.
pub fn parse_records(output: &str, prompt: &str) -> Vec<Record> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != prompt)
        .map(parse_record)
        .collect()
}

fn parse_stream(line: &str, body: &str, record: &mut Record) {
    let Some(inner) = body.strip_prefix('"') else {
        record.stream = Some(body.to_owned());
        record.fail(format!(
            "expected '\"' at column {}",
            column(line, body)
        ));
        return;
    };

    let (text, rest) = unescape_body(inner);
    record.stream = Some(text);
    match rest {
        None => record.fail(format!(
            "unterminated string starting at column {}",
            column(line, body)
        )),
        Some(rest) if !rest.is_empty() => record.fail(format!(
            "unexpected text after string at column {}",
            column(line, rest)
        )),
        Some(_) => {}
    }
}

fn parse_class_and_results(line: &str, body: &str, record: &mut Record) {
    let class_len = body.find(',').unwrap_or(body.len());
    let (class, mut rest) = body.split_at(class_len);
    record.class = class.to_owned();

    if class.is_empty() || !class.chars().all(is_class_char) {
        record.fail(format!(
            "invalid class {:?} at column {}",
            class,
            column(line, body)
        ));
        return;
    }

    while let Some(after_comma) = rest.strip_prefix(',') {
        match result(after_comma, 0) {
            Ok((remaining, entry)) => {
                record.results.push(entry);
                rest = remaining;
            }
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
                record.fail(e.describe(line));
                return;
            }
            Err(nom::Err::Incomplete(_)) => {
                record.fail("unexpected end of line".to_owned());
                return;
            }
        }
    }

    if !rest.is_empty() {
        record.fail(Expected::new(rest, What::Char(',')).describe(line));
    }
}

fn is_class_char(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '-' || c == '_'
}

fn is_variable_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn column(line: &str, at: &str) -> usize {
    line.len() - at.len() + 1
}

/// Decode a quoted MI string. `input` must start at the opening quote.
/// Returns the text and whatever follows the closing quote.
pub fn parse_c_string(input: &str) -> Option<(String, &str)> {
    let (text, rest) = unescape_body(input.strip_prefix('"')?);
    rest.map(|rest| (text, rest))
}

// Decodes up to the closing quote. The second value is `None` when the
// string never terminates; the text is then everything decoded so far.
fn unescape_body(input: &str) -> (String, Option<&str>) {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;

    while idx < bytes.len() {
        match bytes[idx] {
            b'"' => {
                return (
                    String::from_utf8_lossy(&out).into_owned(),
                    Some(&input[idx + 1..]),
                )
            }
            b'\\' => {
                let Some(&escaped) = bytes.get(idx + 1) else {
                    break;
                };
                idx += 2;
                match escaped {
                    b'n' => out.push(b'\n'),
                    b't' => out.push(b'\t'),
                    b'r' => out.push(b'\r'),
                    b'a' => out.push(0x07),
                    b'b' => out.push(0x08),
                    b'f' => out.push(0x0c),
                    b'v' => out.push(0x0b),
                    b'e' => out.push(0x1b),
                    b'0'..=b'7' => {
                        let mut code = u32::from(escaped - b'0');
                        let mut digits = 1;
                        while digits < 3 {
                            match bytes.get(idx) {
                                Some(d @ b'0'..=b'7') => {
                                    code = code * 8 + u32::from(d - b'0');
                                    idx += 1;
                                    digits += 1;
                                }
                                _ => break,
                            }
                        }
                        out.push((code & 0xff) as u8);
                    }
                    // \" \\ and anything unknown stand for themselves
                    other => out.push(other),
                }
            }
            other => {
                out.push(other);
                idx += 1;
            }
        }
    }

    (String::from_utf8_lossy(&out).into_owned(), None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum What {
    Char(char),
    Value,
    Terminator,
    Kind(ErrorKind),
}

/// Where and why the value grammar stopped matching.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Expected<'a> {
    at: &'a str,
    what: What,
}

impl<'a> Expected<'a> {
    fn new(at: &'a str, what: What) -> Self {
        Self { at, what }
    }

    fn describe(&self, line: &str) -> String {
        let col = column(line, self.at);
        let found = match self.at.chars().next() {
            Some(c) => format!("found {:?}", c),
            None => "found end of line".to_owned(),
        };
        match self.what {
            What::Char(c) => format!("expected {:?} at column {}, {}", c, col, found),
            What::Value => format!(
                "expected a value ('\"', '{{' or '[') at column {}, {}",
                col, found
            ),
            What::Terminator => format!("unterminated string starting at column {}", col),
            What::Kind(ErrorKind::TooLarge) => format!("nested too deeply at column {}", col),
            What::Kind(ErrorKind::TakeWhile1) => {
                format!("expected a variable name at column {}, {}", col, found)
            }
            What::Kind(kind) => {
                format!("malformed input at column {} ({:?}), {}", col, kind, found)
            }
        }
    }
}

impl<'a> ParseError<&'a str> for Expected<'a> {
    fn from_error_kind(input: &'a str, kind: ErrorKind) -> Self {
        Self::new(input, What::Kind(kind))
    }

    fn append(_: &'a str, _: ErrorKind, other: Self) -> Self {
        other
    }

    fn from_char(input: &'a str, c: char) -> Self {
        Self::new(input, What::Char(c))
    }

    fn or(self, other: Self) -> Self {
        // report whichever alternative got further into the line
        if other.at.len() < self.at.len() {
            other
        } else {
            self
        }
    }
}

type Res<'a, T> = IResult<&'a str, T, Expected<'a>>;

// Deepest tuple/list nesting accepted before the line is rejected.
const MAX_DEPTH: usize = 64;

fn c_string(input: &str) -> Res<'_, String> {
    let Some(body) = input.strip_prefix('"') else {
        return Err(nom::Err::Error(Expected::new(input, What::Char('"'))));
    };
    match unescape_body(body) {
        (text, Some(rest)) => Ok((rest, text)),
        (_, None) => Err(nom::Err::Failure(Expected::new(input, What::Terminator))),
    }
}

fn variable(input: &str) -> Res<'_, &str> {
    take_while1(is_variable_char).parse(input)
}

fn result<'a>(input: &'a str, depth: usize) -> Res<'a, ResultEntry> {
    map(
        separated_pair(variable, char('='), move |i: &'a str| value(i, depth)),
        |(name, value)| ResultEntry::new(name, value),
    )
    .parse(input)
}

fn value<'a>(input: &'a str, depth: usize) -> Res<'a, Value> {
    match input.chars().next() {
        Some('"') => map(c_string, Value::Const).parse(input),
        Some('{' | '[') if depth >= MAX_DEPTH => Err(nom::Err::Failure(Expected::new(
            input,
            What::Kind(ErrorKind::TooLarge),
        ))),
        Some('{') => tuple(input, depth + 1).map(|(rest, t)| (rest, Value::Tuple(t))),
        Some('[') => list(input, depth + 1).map(|(rest, l)| (rest, Value::List(l))),
        _ => Err(nom::Err::Error(Expected::new(input, What::Value))),
    }
}

fn tuple<'a>(input: &'a str, depth: usize) -> Res<'a, Tuple> {
    map(
        delimited(
            char('{'),
            separated_list0(char(','), move |i: &'a str| result(i, depth)),
            char('}'),
        ),
        Tuple,
    )
    .parse(input)
}

fn list<'a>(input: &'a str, depth: usize) -> Res<'a, List> {
    alt((
        map(
            delimited(
                char('['),
                separated_list1(char(','), move |i: &'a str| result(i, depth)),
                char(']'),
            ),
            List::Results,
        ),
        map(
            delimited(
                char('['),
                separated_list0(char(','), move |i: &'a str| value(i, depth)),
                char(']'),
            ),
            List::Values,
        ),
    ))
    .parse(input)
}
