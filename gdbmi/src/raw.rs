use std::fmt::{self, Display};

use serde::Serialize;
use tracing::{error, warn};

use crate::{Error, ParseHexError};

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub enum Value {
    Const(String),
    Tuple(Tuple),
    List(List),
}

/// A single `variable=value` pair.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ResultEntry {
    variable: String,
    value: Value,
}

/// Named results in the order they appeared. Names may repeat.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct Tuple(pub Vec<ResultEntry>);

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub enum List {
    Values(Vec<Value>),
    // `[frame={..},frame={..}]`, as emitted by -stack-list-frames
    Results(Vec<ResultEntry>),
}

impl From<Tuple> for Value {
    fn from(tuple: Tuple) -> Self {
        Self::Tuple(tuple)
    }
}

impl From<List> for Value {
    fn from(list: List) -> Self {
        Self::List(list)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Const(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Const(s.to_owned())
    }
}

impl From<Vec<ResultEntry>> for Tuple {
    fn from(entries: Vec<ResultEntry>) -> Self {
        Self(entries)
    }
}

impl From<Vec<(&str, Value)>> for Tuple {
    fn from(vec: Vec<(&str, Value)>) -> Self {
        Self(
            vec.into_iter()
                .map(|(variable, value)| ResultEntry::new(variable, value))
                .collect(),
        )
    }
}

impl From<Vec<Value>> for List {
    fn from(values: Vec<Value>) -> Self {
        Self::Values(values)
    }
}

impl ResultEntry {
    pub fn new(variable: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            variable: variable.into(),
            value: value.into(),
        }
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

impl Tuple {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, entry: ResultEntry) {
        self.0.push(entry);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResultEntry> {
        self.0.iter()
    }

    pub fn get(&self, index: usize) -> Option<&ResultEntry> {
        self.0.get(index)
    }

    /// First value bound to `variable`.
    pub fn value_of(&self, variable: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|entry| entry.variable == variable)
            .map(ResultEntry::value)
    }

    /// Every value bound to `variable`, for fields gdb repeats.
    pub fn values_of<'a>(&'a self, variable: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.0
            .iter()
            .filter(move |entry| entry.variable == variable)
            .map(ResultEntry::value)
    }

    pub fn get_const(&self, variable: &str) -> Option<&str> {
        self.value_of(variable).and_then(Value::as_const)
    }

    pub fn get_const_or<'a>(&'a self, variable: &str, default: &'a str) -> &'a str {
        self.get_const(variable).unwrap_or(default)
    }

    pub fn expect_value(&self, variable: &str) -> Result<&Value, Error> {
        self.value_of(variable).ok_or_else(|| {
            warn!("Expected key {} to be present in {}", variable, self);
            Error::ExpectedKey(variable.to_owned())
        })
    }
}

impl List {
    pub fn len(&self) -> usize {
        match self {
            Self::Values(values) => values.len(),
            Self::Results(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_results(&self) -> bool {
        matches!(self, Self::Results(_))
    }

    /// Elements regardless of whether they were named.
    pub fn values(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            Self::Values(values) => Box::new(values.iter()),
            Self::Results(entries) => Box::new(entries.iter().map(ResultEntry::value)),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        match self {
            Self::Values(values) => values.get(index),
            Self::Results(entries) => entries.get(index).map(ResultEntry::value),
        }
    }
}

impl Value {
    pub fn is_const(&self) -> bool {
        matches!(self, Self::Const(_))
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Self::Tuple(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    pub fn as_const(&self) -> Option<&str> {
        match self {
            Self::Const(val) => Some(val),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&Tuple> {
        match self {
            Self::Tuple(val) => Some(val),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Self::List(val) => Some(val),
            _ => None,
        }
    }

    pub fn expect_const(self) -> Result<String, Error> {
        if let Self::Const(val) = self {
            Ok(val)
        } else {
            error!("Expected const, got: {:?}", self);
            Err(Error::ExpectedDifferentPayload)
        }
    }

    pub fn expect_const_ref(&self) -> Result<&str, Error> {
        self.as_const().ok_or_else(|| {
            error!("Expected const, got: {:?}", self);
            Error::ExpectedDifferentPayload
        })
    }

    pub fn expect_tuple_ref(&self) -> Result<&Tuple, Error> {
        self.as_tuple().ok_or_else(|| {
            error!("Expected tuple, got: {:?}", self);
            Error::ExpectedDifferentPayload
        })
    }

    pub fn expect_list_ref(&self) -> Result<&List, Error> {
        self.as_list().ok_or_else(|| {
            error!("Expected list, got: {:?}", self);
            Error::ExpectedDifferentPayload
        })
    }

    pub fn expect_number(&self) -> Result<u32, Error> {
        Ok(self.expect_const_ref()?.parse()?)
    }

    pub fn expect_hex(&self) -> Result<u64, Error> {
        Ok(parse_hex(self.expect_const_ref()?)?)
    }
}

pub fn parse_hex(s: &str) -> Result<u64, ParseHexError> {
    if let Some(hex) = s.strip_prefix("0x") {
        let num = u64::from_str_radix(hex, 16)?;
        Ok(num)
    } else {
        Err(ParseHexError::InvalidPrefix)
    }
}

/// Quote `s` as an MI c-string, the inverse of the parser's unescaping.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c.is_ascii_control() => out.push_str(&format!("\\{:03o}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Const(s) => f.write_str(s),
            Self::Tuple(tuple) => write!(f, "{}", tuple),
            Self::List(list) => write!(f, "{}", list),
        }
    }
}

impl Display for ResultEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.variable, self.value)
    }
}

impl Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        write_joined(f, self.0.iter())?;
        f.write_str("}")
    }
}

impl Display for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        match self {
            Self::Values(values) => write_joined(f, values.iter())?,
            Self::Results(entries) => write_joined(f, entries.iter())?,
        }
        f.write_str("]")
    }
}

fn write_joined<T: Display>(
    f: &mut fmt::Formatter<'_>,
    items: impl Iterator<Item = T>,
) -> fmt::Result {
    for (idx, item) in items.enumerate() {
        if idx > 0 {
            f.write_str(",")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

/// Renders values back into MI wire syntax, consts quoted and escaped.
pub struct MiFormatter;

impl MiFormatter {
    pub fn format_value(value: &Value) -> String {
        match value {
            Value::Const(s) => escape(s),
            Value::Tuple(tuple) => format!("{{{}}}", Self::format_results(&tuple.0)),
            Value::List(List::Values(values)) => format!(
                "[{}]",
                values
                    .iter()
                    .map(Self::format_value)
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            Value::List(List::Results(entries)) => {
                format!("[{}]", Self::format_results(entries))
            }
        }
    }

    pub fn format_results(entries: &[ResultEntry]) -> String {
        entries
            .iter()
            .map(|entry| format!("{}={}", entry.variable, Self::format_value(&entry.value)))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn frame() -> Tuple {
        Tuple::from(vec![
            ("addr", Value::from("0x0000000000400b6c")),
            ("func", Value::from("main")),
            ("args", List::Values(vec![]).into()),
        ])
    }

    #[test]
    fn test_downcasts_for_wrong_variant_are_none() {
        let value = Value::from(frame());
        assert!(value.is_tuple());
        assert!(!value.is_const());
        assert_eq!(value.as_const(), None);
        assert_eq!(value.as_list(), None);
        assert!(value.as_tuple().is_some());
        assert!(value.expect_const_ref().is_err());
    }

    #[test]
    fn test_display() {
        let value = Value::from(frame());
        assert_eq!(
            value.to_string(),
            "{addr=0x0000000000400b6c,func=main,args=[]}"
        );

        let list = List::Values(vec!["2".into(), "3".into()]);
        assert_eq!(list.to_string(), "[2,3]");

        let frames = List::Results(vec![
            ResultEntry::new("frame", frame()),
            ResultEntry::new("frame", Tuple::new()),
        ]);
        assert_eq!(
            frames.to_string(),
            "[frame={addr=0x0000000000400b6c,func=main,args=[]},frame={}]"
        );
    }

    #[test]
    fn test_lookup_keeps_duplicates_in_order() {
        let tuple = Tuple::from(vec![
            ("thread-id", Value::from("1")),
            ("thread-id", Value::from("2")),
        ]);
        assert_eq!(tuple.get_const("thread-id"), Some("1"));
        let all: Vec<_> = tuple.values_of("thread-id").collect();
        assert_eq!(all, vec![&Value::from("1"), &Value::from("2")]);
        assert_eq!(tuple.get_const_or("missing", "0"), "0");
        assert!(matches!(
            tuple.expect_value("missing"),
            Err(Error::ExpectedKey(key)) if key == "missing"
        ));
    }

    #[test]
    fn test_numeric_helpers() -> eyre::Result<()> {
        assert_eq!(Value::from("42").expect_number()?, 42);
        assert_eq!(Value::from("0x1f").expect_hex()?, 31);
        assert!(matches!(
            Value::from("1f").expect_hex(),
            Err(Error::ParseHex(ParseHexError::InvalidPrefix))
        ));
        Ok(())
    }

    #[test]
    fn test_mi_formatter_quotes_consts() {
        let value = Value::from(Tuple::from(vec![
            ("msg", Value::from("say \"hi\"\n")),
            ("ids", List::Values(vec!["1".into()]).into()),
        ]));
        assert_eq!(
            MiFormatter::format_value(&value),
            r#"{msg="say \"hi\"\n",ids=["1"]}"#
        );
    }
}
