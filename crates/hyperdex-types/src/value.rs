//! Attribute types and wire-level value validation.
//!
//! Scalars: `string` (opaque bytes), `int64` (little-endian signed),
//! `float` (little-endian IEEE-754 double), `document` (opaque JSON
//! bytes). Containers are homogeneous over the scalar types and
//! serialize as concatenations: length-prefixed for strings, fixed-width
//! for int64/float. Lists preserve order, sets are sorted and
//! deduplicated, maps are sorted by key.

use std::fmt::{self, Display};

/// The scalar element types allowed inside containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    String,
    Int64,
    Float,
}

impl ScalarType {
    fn token(self) -> &'static str {
        match self {
            ScalarType::String => "string",
            ScalarType::Int64 => "int64",
            ScalarType::Float => "float",
        }
    }
}

/// The type of one attribute of a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    String,
    Int64,
    Float,
    Document,
    List(ScalarType),
    Set(ScalarType),
    Map(ScalarType, ScalarType),
}

impl AttributeType {
    /// Parses a configuration token such as `int64` or `map(string,int64)`.
    ///
    /// Container element types follow the coordinator's grammar: lists and
    /// sets over `string` or `int64`, maps over `string`/`int64` keys and
    /// values. Returns `None` for anything else.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "string" => return Some(AttributeType::String),
            "int64" => return Some(AttributeType::Int64),
            "float" => return Some(AttributeType::Float),
            "document" => return Some(AttributeType::Document),
            _ => {}
        }

        let inner = |prefix: &str| -> Option<&str> {
            token
                .strip_prefix(prefix)?
                .strip_prefix('(')?
                .strip_suffix(')')
        };

        let scalar = |tok: &str| -> Option<ScalarType> {
            match tok {
                "string" => Some(ScalarType::String),
                "int64" => Some(ScalarType::Int64),
                _ => None,
            }
        };

        if let Some(elem) = inner("list") {
            return Some(AttributeType::List(scalar(elem)?));
        }

        if let Some(elem) = inner("set") {
            return Some(AttributeType::Set(scalar(elem)?));
        }

        if let Some(kv) = inner("map") {
            let (k, v) = kv.split_once(',')?;
            return Some(AttributeType::Map(scalar(k.trim())?, scalar(v.trim())?));
        }

        None
    }

    /// Whether this attribute may participate in subspace hashing.
    ///
    /// Containers and floats are unsearchable; the configuration parser
    /// rejects subspaces that hash them.
    pub fn is_searchable(self) -> bool {
        matches!(self, AttributeType::String | AttributeType::Int64)
    }

    /// Validates that `data` is a well-formed serialization of this type.
    pub fn validate(self, data: &[u8]) -> bool {
        match self {
            AttributeType::String | AttributeType::Document => true,
            AttributeType::Int64 => data.len() <= 8,
            AttributeType::Float => data.len() == 8,
            AttributeType::List(elem) => split_elements(elem, data).is_some(),
            AttributeType::Set(elem) => match split_elements(elem, data) {
                Some(elems) => strictly_sorted(elem, &elems),
                None => false,
            },
            AttributeType::Map(kt, vt) => validate_map(kt, vt, data),
        }
    }
}

impl Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeType::String => write!(f, "string"),
            AttributeType::Int64 => write!(f, "int64"),
            AttributeType::Float => write!(f, "float"),
            AttributeType::Document => write!(f, "document"),
            AttributeType::List(e) => write!(f, "list({})", e.token()),
            AttributeType::Set(e) => write!(f, "set({})", e.token()),
            AttributeType::Map(k, v) => write!(f, "map({},{})", k.token(), v.token()),
        }
    }
}

/// Splits a container serialization into its elements, or `None` if the
/// bytes are malformed.
fn split_elements(elem: ScalarType, data: &[u8]) -> Option<Vec<&[u8]>> {
    let mut elems = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        let (e, tail) = split_one(elem, rest)?;
        elems.push(e);
        rest = tail;
    }

    Some(elems)
}

/// Splits one element off the front of a container serialization.
fn split_one(elem: ScalarType, data: &[u8]) -> Option<(&[u8], &[u8])> {
    match elem {
        ScalarType::String => {
            if data.len() < 4 {
                return None;
            }
            let sz = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
            if data.len() < 4 + sz {
                return None;
            }
            Some((&data[4..4 + sz], &data[4 + sz..]))
        }
        ScalarType::Int64 | ScalarType::Float => {
            if data.len() < 8 {
                return None;
            }
            Some((&data[..8], &data[8..]))
        }
    }
}

fn element_less(elem: ScalarType, a: &[u8], b: &[u8]) -> bool {
    match elem {
        ScalarType::String => a < b,
        ScalarType::Int64 => {
            let x = i64::from_le_bytes(a.try_into().unwrap());
            let y = i64::from_le_bytes(b.try_into().unwrap());
            x < y
        }
        ScalarType::Float => {
            let x = f64::from_le_bytes(a.try_into().unwrap());
            let y = f64::from_le_bytes(b.try_into().unwrap());
            x.total_cmp(&y) == std::cmp::Ordering::Less
        }
    }
}

fn strictly_sorted(elem: ScalarType, elems: &[&[u8]]) -> bool {
    elems.windows(2).all(|w| element_less(elem, w[0], w[1]))
}

fn validate_map(kt: ScalarType, vt: ScalarType, data: &[u8]) -> bool {
    let mut keys: Vec<&[u8]> = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        let Some((k, tail)) = split_one(kt, rest) else {
            return false;
        };
        let Some((_v, tail)) = split_one(vt, tail) else {
            return false;
        };
        keys.push(k);
        rest = tail;
    }

    strictly_sorted(kt, &keys)
}
