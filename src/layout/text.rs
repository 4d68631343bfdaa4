//! The textual form of layouts, as they appear in the intermediate representation.
//!
//! ```text
//! #blocked<{sizePerThread = [1, 4], threadsPerWarp = [8, 4], warpsPerCTA = [4, 1], order = [1, 0]}>
//! #slice<{dim = 0, parent = #mma<{versionMajor = 2, versionMinor = 0, warpsPerCTA = [2, 2], instrShape = [16, 8]}>}>
//! ```

use std::{fmt, sync::OnceLock};

use itertools::Itertools;
use regex::Regex;
use rustc_hash::FxHashMap as HashMap;
use serde::{
    de::{DeserializeSeed, Visitor},
    Deserializer, Serialize, Serializer,
};
use thiserror::Error;

use super::{
    BlockedEncoding, CtaLayout, DotOperandEncoding, Encoding, Layout, LayoutError, MmaEncoding,
    SharedEncoding, SliceEncoding,
};
use crate::context::Context;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unexpected character {0:?} at offset {1}")]
    Lex(char, usize),
    #[error("expected {expected}, found {found}")]
    Expected { expected: &'static str, found: String },
    #[error("unknown layout kind #{0}")]
    UnknownKind(String),
    #[error("#{kind} is missing the mandatory field {key}")]
    MissingKey { kind: &'static str, key: &'static str },
    #[error("#{kind} has no field named {key}")]
    UnknownKey { kind: &'static str, key: String },
    #[error("field {0} is given twice")]
    DuplicateKey(String),
    #[error("field {key} expects {expected}")]
    Type { key: &'static str, expected: &'static str },
    #[error("integer {0} out of range")]
    Integer(String),
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

fn write_array(f: &mut fmt::Formatter<'_>, values: &[u32]) -> fmt::Result {
    write!(f, "[{}]", values.iter().join(", "))
}

fn write_cta_layout(f: &mut fmt::Formatter<'_>, cta_layout: &CtaLayout) -> fmt::Result {
    if cta_layout.is_default() {
        return Ok(());
    }
    write!(f, ", CTAsPerCGA = ")?;
    write_array(f, cta_layout.ctas_per_cga())?;
    write!(f, ", CTASplitNum = ")?;
    write_array(f, cta_layout.cta_split_num())?;
    write!(f, ", CTAOrder = ")?;
    write_array(f, cta_layout.cta_order())
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}<{{", self.kind())?;
        match self {
            Encoding::Blocked(layout) => {
                write!(f, "sizePerThread = ")?;
                write_array(f, layout.size_per_thread())?;
                write!(f, ", threadsPerWarp = ")?;
                write_array(f, layout.threads_per_warp())?;
                write!(f, ", warpsPerCTA = ")?;
                write_array(f, layout.warps_per_cta())?;
                write!(f, ", order = ")?;
                write_array(f, layout.order())?;
                write_cta_layout(f, layout.cta_layout())?;
            }
            Encoding::Mma(layout) => {
                write!(
                    f,
                    "versionMajor = {}, versionMinor = {}, warpsPerCTA = ",
                    layout.version_major(),
                    layout.version_minor()
                )?;
                write_array(f, layout.warps_per_cta())?;
                write!(f, ", instrShape = ")?;
                write_array(f, layout.instr_shape())?;
                write_cta_layout(f, layout.cta_layout())?;
            }
            Encoding::Slice(layout) => {
                write!(f, "dim = {}, parent = {}", layout.dim(), layout.parent())?;
            }
            Encoding::DotOperand(layout) => {
                write!(f, "opIdx = {}, parent = {}", layout.op_idx(), layout.parent())?;
                if layout.widen_factor() != 0 {
                    write!(f, ", kWidth = {}", layout.widen_factor())?;
                }
            }
            Encoding::Shared(layout) => {
                write!(
                    f,
                    "vec = {}, perPhase = {}, maxPhase = {}, order = ",
                    layout.vec(),
                    layout.per_phase(),
                    layout.max_phase()
                )?;
                write_array(f, layout.order())?;
                write!(f, ", hasLeadingOffset = {}", layout.has_leading_offset())?;
                write_cta_layout(f, layout.cta_layout())?;
            }
        }
        write!(f, "}}>")
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.encoding().fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Kind(&'a str),
    Ident(&'a str),
    Int(&'a str),
    Punct(char),
}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Kind(kind) => write!(f, "#{kind}"),
            Token::Ident(ident) | Token::Int(ident) => write!(f, "{ident}"),
            Token::Punct(c) => write!(f, "'{c}'"),
        }
    }
}

fn token_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^\s*(?:#([A-Za-z_]+)|([A-Za-z_][A-Za-z0-9_]*)|([0-9]+)|([<>{}\[\]=,]))")
            .expect("token pattern is valid")
    })
}

fn tokenize(text: &str) -> Result<Vec<Token<'_>>, ParseError> {
    let regex = token_regex();
    let mut tokens = vec![];
    let mut offset = 0;
    while !text[offset..].trim_start().is_empty() {
        let rest = &text[offset..];
        let Some(captures) = regex.captures(rest) else {
            let skipped = rest.len() - rest.trim_start().len();
            let c = rest.trim_start().chars().next().unwrap_or_default();
            return Err(ParseError::Lex(c, offset + skipped));
        };
        let token = match (captures.get(1), captures.get(2), captures.get(3), captures.get(4)) {
            (Some(kind), ..) => Token::Kind(kind.as_str()),
            (_, Some(ident), ..) => Token::Ident(ident.as_str()),
            (_, _, Some(int), _) => Token::Int(int.as_str()),
            (.., Some(punct)) => Token::Punct(punct.as_str().chars().next().unwrap_or_default()),
            _ => unreachable!("one group matches whenever the pattern does"),
        };
        tokens.push(token);
        offset += captures.get(0).map_or(0, |m| m.end());
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Value {
    Int(u32),
    Bool(bool),
    Array(Vec<u32>),
    Layout(Layout),
}

/// The fields of one `#kind<{...}>` literal, consumed key by key.
struct Fields {
    kind: &'static str,
    map: HashMap<String, Value>,
}

impl Fields {
    fn take(&mut self, key: &'static str) -> Result<Value, ParseError> {
        self.take_opt(key).ok_or(ParseError::MissingKey {
            kind: self.kind,
            key,
        })
    }

    fn take_opt(&mut self, key: &'static str) -> Option<Value> {
        self.map.remove(key)
    }

    fn take_u32(&mut self, key: &'static str) -> Result<u32, ParseError> {
        match self.take(key)? {
            Value::Int(x) => Ok(x),
            _ => Err(ParseError::Type {
                key,
                expected: "an integer",
            }),
        }
    }

    fn take_bool(&mut self, key: &'static str) -> Result<Option<bool>, ParseError> {
        match self.take_opt(key) {
            None => Ok(None),
            Some(Value::Bool(x)) => Ok(Some(x)),
            Some(_) => Err(ParseError::Type {
                key,
                expected: "true or false",
            }),
        }
    }

    fn take_array(&mut self, key: &'static str) -> Result<Vec<u32>, ParseError> {
        match self.take(key)? {
            Value::Array(x) => Ok(x),
            _ => Err(ParseError::Type {
                key,
                expected: "an array of integers",
            }),
        }
    }

    fn take_layout(&mut self, key: &'static str) -> Result<Layout, ParseError> {
        match self.take(key)? {
            Value::Layout(x) => Ok(x),
            _ => Err(ParseError::Type {
                key,
                expected: "a layout",
            }),
        }
    }

    /// CTA fields, defaulting to a single CTA when all three are absent.
    fn take_cta_layout(&mut self, rank: usize) -> Result<CtaLayout, ParseError> {
        let keys = ["CTAsPerCGA", "CTASplitNum", "CTAOrder"];
        if keys.iter().all(|key| !self.map.contains_key(*key)) {
            return Ok(CtaLayout::default_for(rank));
        }
        let ctas_per_cga = self.take_array("CTAsPerCGA")?;
        let cta_split_num = self.take_array("CTASplitNum")?;
        let cta_order = self.take_array("CTAOrder")?;
        Ok(CtaLayout::new(ctas_per_cga, cta_split_num, cta_order)?)
    }

    fn finish(self) -> Result<(), ParseError> {
        match self.map.into_keys().sorted().next() {
            Some(key) => Err(ParseError::UnknownKey {
                kind: self.kind,
                key,
            }),
            None => Ok(()),
        }
    }
}

struct Parser<'a, 'c> {
    context: &'c Context,
    tokens: Vec<Token<'a>>,
    cursor: usize,
}

impl<'a> Parser<'a, '_> {
    fn peek(&self) -> Option<Token<'a>> {
        self.tokens.get(self.cursor).copied()
    }

    fn next(&mut self, expected: &'static str) -> Result<Token<'a>, ParseError> {
        let token = self.peek().ok_or_else(|| ParseError::Expected {
            expected,
            found: "end of input".into(),
        })?;
        self.cursor += 1;
        Ok(token)
    }

    fn expect(&mut self, punct: char, expected: &'static str) -> Result<(), ParseError> {
        match self.next(expected)? {
            Token::Punct(c) if c == punct => Ok(()),
            token => Err(ParseError::Expected {
                expected,
                found: token.to_string(),
            }),
        }
    }

    fn eat(&mut self, punct: char) -> bool {
        match self.peek() {
            Some(Token::Punct(c)) if c == punct => {
                self.cursor += 1;
                true
            }
            _ => false,
        }
    }

    fn int(text: &str) -> Result<u32, ParseError> {
        text.parse()
            .map_err(|_| ParseError::Integer(text.to_string()))
    }

    fn value(&mut self) -> Result<Value, ParseError> {
        match self.next("a value")? {
            Token::Int(x) => Ok(Value::Int(Self::int(x)?)),
            Token::Ident("true") => Ok(Value::Bool(true)),
            Token::Ident("false") => Ok(Value::Bool(false)),
            Token::Punct('[') => {
                let mut values = vec![];
                if self.eat(']') {
                    return Ok(Value::Array(values));
                }
                loop {
                    match self.next("an integer")? {
                        Token::Int(x) => values.push(Self::int(x)?),
                        token => {
                            return Err(ParseError::Expected {
                                expected: "an integer",
                                found: token.to_string(),
                            })
                        }
                    }
                    if self.eat(']') {
                        break;
                    }
                    self.expect(',', "',' or ']'")?;
                }
                Ok(Value::Array(values))
            }
            Token::Kind(_) => {
                self.cursor -= 1;
                self.layout().map(Value::Layout)
            }
            token => Err(ParseError::Expected {
                expected: "a value",
                found: token.to_string(),
            }),
        }
    }

    fn fields(&mut self, kind: &'static str) -> Result<Fields, ParseError> {
        self.expect('<', "'<'")?;
        self.expect('{', "'{'")?;
        let mut map = HashMap::default();
        if !self.eat('}') {
            loop {
                let key = match self.next("a field name")? {
                    Token::Ident(key) => key,
                    token => {
                        return Err(ParseError::Expected {
                            expected: "a field name",
                            found: token.to_string(),
                        })
                    }
                };
                self.expect('=', "'='")?;
                let value = self.value()?;
                if map.insert(key.to_string(), value).is_some() {
                    return Err(ParseError::DuplicateKey(key.to_string()));
                }
                if self.eat('}') {
                    break;
                }
                self.expect(',', "',' or '}'")?;
            }
        }
        self.expect('>', "'>'")?;
        Ok(Fields { kind, map })
    }

    fn layout(&mut self) -> Result<Layout, ParseError> {
        let kind = match self.next("a layout")? {
            Token::Kind(kind) => kind,
            token => {
                return Err(ParseError::Expected {
                    expected: "a layout",
                    found: token.to_string(),
                })
            }
        };

        let encoding: Encoding = match kind {
            "blocked" => {
                let mut fields = self.fields("blocked")?;
                let size_per_thread = fields.take_array("sizePerThread")?;
                let threads_per_warp = fields.take_array("threadsPerWarp")?;
                let warps_per_cta = fields.take_array("warpsPerCTA")?;
                let order = fields.take_array("order")?;
                let cta_layout = fields.take_cta_layout(order.len())?;
                fields.finish()?;
                BlockedEncoding::new(
                    size_per_thread,
                    threads_per_warp,
                    warps_per_cta,
                    order,
                    cta_layout,
                )?
                .into()
            }
            "mma" => {
                let mut fields = self.fields("mma")?;
                let major = fields.take_u32("versionMajor")?;
                let minor = fields.take_u32("versionMinor")?;
                let warps_per_cta = fields.take_array("warpsPerCTA")?;
                let instr_shape = fields.take_array("instrShape")?;
                let cta_layout = fields.take_cta_layout(warps_per_cta.len())?;
                fields.finish()?;
                MmaEncoding::new(major, minor, warps_per_cta, cta_layout, instr_shape)?.into()
            }
            "slice" => {
                let mut fields = self.fields("slice")?;
                let dim = fields.take_u32("dim")?;
                let parent = fields.take_layout("parent")?;
                fields.finish()?;
                SliceEncoding::new(dim, parent)?.into()
            }
            "dot_op" => {
                let mut fields = self.fields("dot_op")?;
                let op_idx = fields.take_u32("opIdx")?;
                let parent = fields.take_layout("parent")?;
                let widen_factor = match fields.take_opt("kWidth") {
                    Some(Value::Int(x)) => x,
                    Some(_) => {
                        return Err(ParseError::Type {
                            key: "kWidth",
                            expected: "an integer",
                        })
                    }
                    None => 0,
                };
                fields.finish()?;
                DotOperandEncoding::new(op_idx, parent, widen_factor)?.into()
            }
            "shared" => {
                let mut fields = self.fields("shared")?;
                let vec = fields.take_u32("vec")?;
                let per_phase = fields.take_u32("perPhase")?;
                let max_phase = fields.take_u32("maxPhase")?;
                let order = fields.take_array("order")?;
                let has_leading_offset = fields.take_bool("hasLeadingOffset")?.unwrap_or(false);
                let cta_layout = fields.take_cta_layout(order.len())?;
                fields.finish()?;
                SharedEncoding::with_leading_offset(
                    vec,
                    per_phase,
                    max_phase,
                    order,
                    cta_layout,
                    has_leading_offset,
                )?
                .into()
            }
            kind => return Err(ParseError::UnknownKind(kind.to_string())),
        };
        Ok(self.context.get(encoding)?)
    }
}

/// Parses one layout, interning it and every parent it names in `context`.
pub(crate) fn parse(context: &Context, text: &str) -> Result<Layout, ParseError> {
    let tokens = tokenize(text)?;
    let mut parser = Parser {
        context,
        tokens,
        cursor: 0,
    };
    let layout = parser.layout()?;
    match parser.peek() {
        Some(token) => Err(ParseError::Expected {
            expected: "end of input",
            found: token.to_string(),
        }),
        None => Ok(layout),
    }
}

impl Serialize for Layout {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Deserializes a layout from its textual form, interning it in `context`.
pub struct LayoutSeed {
    pub context: Context,
}

impl LayoutSeed {
    pub fn new(context: Context) -> Self {
        Self { context }
    }
}

impl<'de> DeserializeSeed<'de> for LayoutSeed {
    type Value = Layout;

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct LayoutVisitor {
            context: Context,
        }

        impl<'de> Visitor<'de> for LayoutVisitor {
            type Value = Layout;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a layout in textual form")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.context.parse_layout(v).map_err(E::custom)
            }
        }

        let visitor = LayoutVisitor {
            context: self.context,
        };
        deserializer.deserialize_str(visitor)
    }
}
