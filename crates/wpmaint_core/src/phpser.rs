//! Reader and writer for the PHP `serialize()` format WordPress stores in
//! option and meta rows. String lengths are byte counts, so values are
//! decoded from the raw UTF-8 bytes rather than by character.

use std::fmt::Write as _;

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum PhpValue {
    Null,
    Bool(bool),
    Int(i64),
    /// Literal text as written (`1.5`, `INF`, `1.0E+25`), kept verbatim so an
    /// untouched value re-serializes byte-for-byte.
    Float(String),
    String(String),
    Array(Vec<(PhpKey, PhpValue)>),
    Object {
        class: String,
        members: Vec<(PhpKey, PhpValue)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhpKey {
    Int(i64),
    Str(String),
}

impl PhpKey {
    pub fn as_display(&self) -> String {
        match self {
            Self::Int(value) => value.to_string(),
            Self::Str(value) => value.clone(),
        }
    }
}

impl PhpValue {
    /// A sequential list (`0..n` integer keys) of strings.
    pub fn string_list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(index, item)| (PhpKey::Int(index as i64), Self::String(item.into())))
                .collect(),
        )
    }

    /// String values of an array in stored order. Non-string entries make this `None`.
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        let Self::Array(entries) = self else {
            return None;
        };
        entries
            .iter()
            .map(|(_, value)| match value {
                Self::String(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::String(text) => text.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&PhpValue> {
        let entries = match self {
            Self::Array(entries) => entries,
            Self::Object { members, .. } => members,
            _ => return None,
        };
        entries
            .iter()
            .find(|(entry_key, _)| match entry_key {
                PhpKey::Str(name) => name == key,
                PhpKey::Int(index) => key.parse::<i64>().ok() == Some(*index),
            })
            .map(|(_, value)| value)
    }

    /// Rebuild the value with every string leaf and string key passed through
    /// `map`. Class names are left untouched.
    pub fn map_strings<F>(&self, map: &mut F) -> PhpValue
    where
        F: FnMut(&str) -> String,
    {
        match self {
            Self::String(text) => Self::String(map(text)),
            Self::Array(entries) => Self::Array(map_entries(entries, map)),
            Self::Object { class, members } => Self::Object {
                class: class.clone(),
                members: map_entries(members, map),
            },
            other => other.clone(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(value) => Value::Bool(*value),
            Self::Int(value) => Value::from(*value),
            Self::Float(raw) => raw
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(raw.clone())),
            Self::String(text) => Value::String(text.clone()),
            Self::Array(entries) => {
                let sequential = entries
                    .iter()
                    .enumerate()
                    .all(|(index, (key, _))| *key == PhpKey::Int(index as i64));
                if sequential {
                    Value::Array(entries.iter().map(|(_, value)| value.to_json()).collect())
                } else {
                    Value::Object(entries_to_json(entries))
                }
            }
            Self::Object { class, members } => {
                let mut object = entries_to_json(members);
                object.insert("__class".to_string(), Value::String(class.clone()));
                Value::Object(object)
            }
        }
    }
}

fn map_entries<F>(entries: &[(PhpKey, PhpValue)], map: &mut F) -> Vec<(PhpKey, PhpValue)>
where
    F: FnMut(&str) -> String,
{
    entries
        .iter()
        .map(|(key, value)| {
            let key = match key {
                PhpKey::Str(text) => PhpKey::Str(map(text)),
                PhpKey::Int(index) => PhpKey::Int(*index),
            };
            (key, value.map_strings(map))
        })
        .collect()
}

fn entries_to_json(entries: &[(PhpKey, PhpValue)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| (key.as_display(), value.to_json()))
        .collect()
}

/// Cheap shape check mirroring WordPress' `is_serialized()`.
pub fn looks_serialized(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed == "N;" {
        return true;
    }
    if trimmed.len() < 4 || trimmed.as_bytes()[1] != b':' {
        return false;
    }
    let tag = trimmed.as_bytes()[0];
    let last = trimmed.as_bytes()[trimmed.len() - 1];
    match tag {
        b'a' | b'O' => last == b'}',
        b's' => last == b';' && trimmed.ends_with("\";"),
        b'b' | b'i' | b'd' => last == b';',
        _ => false,
    }
}

pub fn parse(input: &str) -> Result<PhpValue> {
    let mut parser = Parser {
        input: input.as_bytes(),
        pos: 0,
    };
    let value = parser.value()?;
    if parser.pos != parser.input.len() {
        bail!(
            "trailing data after serialized value at byte {}",
            parser.pos
        );
    }
    Ok(value)
}

pub fn serialize(value: &PhpValue) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &PhpValue) {
    match value {
        PhpValue::Null => out.push_str("N;"),
        PhpValue::Bool(flag) => {
            let _ = write!(out, "b:{};", u8::from(*flag));
        }
        PhpValue::Int(number) => {
            let _ = write!(out, "i:{number};");
        }
        PhpValue::Float(raw) => {
            let _ = write!(out, "d:{raw};");
        }
        PhpValue::String(text) => write_string(out, text),
        PhpValue::Array(entries) => {
            let _ = write!(out, "a:{}:{{", entries.len());
            write_entries(out, entries);
            out.push('}');
        }
        PhpValue::Object { class, members } => {
            let _ = write!(out, "O:{}:\"{class}\":{}:{{", class.len(), members.len());
            write_entries(out, members);
            out.push('}');
        }
    }
}

fn write_entries(out: &mut String, entries: &[(PhpKey, PhpValue)]) {
    for (key, value) in entries {
        match key {
            PhpKey::Int(index) => {
                let _ = write!(out, "i:{index};");
            }
            PhpKey::Str(name) => write_string(out, name),
        }
        write_value(out, value);
    }
}

fn write_string(out: &mut String, text: &str) {
    let _ = write!(out, "s:{}:\"{text}\";", text.len());
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn value(&mut self) -> Result<PhpValue> {
        let tag = self.next_byte()?;
        match tag {
            b'N' => {
                self.expect(b';')?;
                Ok(PhpValue::Null)
            }
            b'b' => {
                self.expect(b':')?;
                match self.read_until(b';')? {
                    "0" => Ok(PhpValue::Bool(false)),
                    "1" => Ok(PhpValue::Bool(true)),
                    other => bail!("invalid boolean literal `{other}`"),
                }
            }
            b'i' => {
                self.expect(b':')?;
                Ok(PhpValue::Int(self.read_int_until(b';')?))
            }
            b'd' => {
                self.expect(b':')?;
                let raw = self.read_until(b';')?;
                let valid = matches!(raw, "INF" | "-INF" | "NAN") || raw.parse::<f64>().is_ok();
                if !valid {
                    bail!("invalid float literal `{raw}`");
                }
                Ok(PhpValue::Float(raw.to_string()))
            }
            b's' => {
                self.expect(b':')?;
                let text = self.length_prefixed_string()?;
                self.expect(b';')?;
                Ok(PhpValue::String(text))
            }
            b'a' => {
                self.expect(b':')?;
                let count = self.read_count_until(b':')?;
                Ok(PhpValue::Array(self.entries(count)?))
            }
            b'O' => {
                self.expect(b':')?;
                let class = self.length_prefixed_string()?;
                self.expect(b':')?;
                let count = self.read_count_until(b':')?;
                Ok(PhpValue::Object {
                    class,
                    members: self.entries(count)?,
                })
            }
            other => bail!(
                "unsupported serialized type `{}` at byte {}",
                char::from(other),
                self.pos - 1
            ),
        }
    }

    fn entries(&mut self, count: usize) -> Result<Vec<(PhpKey, PhpValue)>> {
        self.expect(b'{')?;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let key = match self.value()? {
                PhpValue::Int(index) => PhpKey::Int(index),
                PhpValue::String(name) => PhpKey::Str(name),
                _ => bail!("array keys must be integers or strings (byte {})", self.pos),
            };
            let value = self.value()?;
            entries.push((key, value));
        }
        self.expect(b'}')?;
        Ok(entries)
    }

    /// `<len>:"<bytes>"` with the length counted in bytes.
    fn length_prefixed_string(&mut self) -> Result<String> {
        let length = self.read_count_until(b':')?;
        self.expect(b'"')?;
        let end = self
            .pos
            .checked_add(length)
            .filter(|end| *end <= self.input.len())
            .ok_or_else(|| anyhow::anyhow!("string length {length} runs past end of input"))?;
        let text = std::str::from_utf8(&self.input[self.pos..end])
            .context("string length splits a UTF-8 sequence")?
            .to_string();
        self.pos = end;
        self.expect(b'"')?;
        Ok(text)
    }

    fn next_byte(&mut self) -> Result<u8> {
        let byte = *self
            .input
            .get(self.pos)
            .ok_or_else(|| anyhow::anyhow!("unexpected end of serialized input"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn expect(&mut self, expected: u8) -> Result<()> {
        let at = self.pos;
        let found = self.next_byte()?;
        if found != expected {
            bail!(
                "expected `{}` at byte {at}, found `{}`",
                char::from(expected),
                char::from(found)
            );
        }
        Ok(())
    }

    fn read_until(&mut self, terminator: u8) -> Result<&'a str> {
        let start = self.pos;
        let offset = self.input[start..]
            .iter()
            .position(|byte| *byte == terminator)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "missing `{}` after byte {start}",
                    char::from(terminator)
                )
            })?;
        self.pos = start + offset + 1;
        let input: &'a [u8] = self.input;
        std::str::from_utf8(&input[start..start + offset]).context("invalid UTF-8 in token")
    }

    fn read_int_until(&mut self, terminator: u8) -> Result<i64> {
        let raw = self.read_until(terminator)?;
        raw.parse::<i64>()
            .with_context(|| format!("invalid integer literal `{raw}`"))
    }

    fn read_count_until(&mut self, terminator: u8) -> Result<usize> {
        let raw = self.read_until(terminator)?;
        raw.parse::<usize>()
            .with_context(|| format!("invalid length literal `{raw}`"))
    }
}
