//! Non-input arguments of an invocation.
//!
//! Positional and keyword arguments are recorded verbatim on every
//! invocation record, so they have to be inspectable (to find tensors in
//! them) and serializable (for graph descriptions).

use crate::tensor::Tensor;
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub enum Arg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tensor(Tensor),
    List(Vec<Arg>),
}

/// How a keyword appears in a call: missing, explicitly null, or set.
#[derive(Debug, Clone, Copy)]
pub enum Presence<'a> {
    Absent,
    Null,
    Value(&'a Arg),
}

impl Arg {
    pub fn is_null(&self) -> bool {
        matches!(self, Arg::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Arg::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Every tensor reachable from this argument, depth first.
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut out = Vec::new();
        self.collect_tensors(&mut out);
        out
    }

    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        match self {
            Arg::Tensor(t) => out.push(t),
            Arg::List(items) => items.iter().for_each(|a| a.collect_tensors(out)),
            _ => {}
        }
    }

    pub fn map_tensors<E>(&self, f: &mut impl FnMut(&Tensor) -> Result<Arg, E>) -> Result<Arg, E> {
        Ok(match self {
            Arg::Tensor(t) => f(t)?,
            Arg::List(items) => Arg::List(
                items
                    .iter()
                    .map(|a| a.map_tensors(f))
                    .collect::<Result<_, _>>()?,
            ),
            other => other.clone(),
        })
    }

    /// JSON form of a tensor-free argument. Tensors are not representable
    /// here; graph descriptions encode them as edges instead.
    pub fn to_json(&self) -> Option<Json> {
        Some(match self {
            Arg::Null => Json::Null,
            Arg::Bool(b) => json!(b),
            Arg::Int(i) => json!(i),
            Arg::Float(f) => json!(f),
            Arg::Str(s) => json!(s),
            Arg::Tensor(_) => return None,
            Arg::List(items) => Json::Array(
                items
                    .iter()
                    .map(Arg::to_json)
                    .collect::<Option<Vec<_>>>()?,
            ),
        })
    }

    pub fn from_json(json: &Json) -> Option<Arg> {
        Some(match json {
            Json::Null => Arg::Null,
            Json::Bool(b) => Arg::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Arg::Int(i),
                None => Arg::Float(n.as_f64()?),
            },
            Json::String(s) => Arg::Str(s.clone()),
            Json::Array(items) => Arg::List(
                items
                    .iter()
                    .map(Arg::from_json)
                    .collect::<Option<Vec<_>>>()?,
            ),
            Json::Object(_) => return None,
        })
    }
}

impl From<bool> for Arg {
    fn from(b: bool) -> Self {
        Arg::Bool(b)
    }
}

impl From<i64> for Arg {
    fn from(i: i64) -> Self {
        Arg::Int(i)
    }
}

impl From<f64> for Arg {
    fn from(f: f64) -> Self {
        Arg::Float(f)
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<Tensor> for Arg {
    fn from(t: Tensor) -> Self {
        Arg::Tensor(t)
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(v: Option<T>) -> Self {
        v.map_or(Arg::Null, Into::into)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub positional: Vec<Arg>,
    pub keyword: BTreeMap<String, Arg>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_positional(mut self, arg: impl Into<Arg>) -> Self {
        self.positional.push(arg.into());
        self
    }

    pub fn with_keyword(mut self, name: &str, arg: impl Into<Arg>) -> Self {
        self.keyword.insert(name.to_string(), arg.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arg> {
        self.keyword.get(name)
    }

    pub fn presence(&self, name: &str) -> Presence<'_> {
        match self.keyword.get(name) {
            None => Presence::Absent,
            Some(Arg::Null) => Presence::Null,
            Some(arg) => Presence::Value(arg),
        }
    }

    pub fn set(&mut self, name: &str, arg: Arg) {
        self.keyword.insert(name.to_string(), arg);
    }

    pub fn remove(&mut self, name: &str) -> Option<Arg> {
        self.keyword.remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Tensors in positional order followed by keyword order.
    pub fn tensors(&self) -> Vec<&Tensor> {
        self.positional
            .iter()
            .chain(self.keyword.values())
            .flat_map(Arg::tensors)
            .collect()
    }

    pub fn map_tensors<E>(
        &self,
        mut f: impl FnMut(&Tensor) -> Result<Arg, E>,
    ) -> Result<CallArgs, E> {
        let positional = self
            .positional
            .iter()
            .map(|a| a.map_tensors(&mut f))
            .collect::<Result<_, _>>()?;
        let mut keyword = BTreeMap::new();
        for (k, a) in &self.keyword {
            keyword.insert(k.clone(), a.map_tensors(&mut f)?);
        }
        Ok(CallArgs {
            positional,
            keyword,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::value::Value;

    #[test]
    fn test_presence() {
        let args = CallArgs::new()
            .with_keyword("training", Arg::Null)
            .with_keyword("rate", 0.5);
        assert!(matches!(args.presence("training"), Presence::Null));
        assert!(matches!(args.presence("rate"), Presence::Value(Arg::Float(_))));
        assert!(matches!(args.presence("mask"), Presence::Absent));
    }

    #[test]
    fn test_json_excludes_tensors() {
        let plain = Arg::List(vec![Arg::Int(1), Arg::Str("x".into()), Arg::Null]);
        let json = plain.to_json().unwrap();
        assert_eq!(json, serde_json::json!([1, "x", null]));
        assert!(matches!(Arg::from_json(&json), Some(Arg::List(items)) if items.len() == 3));

        let t = Tensor::new(Value::zeros(&[1], DType::F32));
        assert!(Arg::List(vec![Arg::Tensor(t)]).to_json().is_none());
    }

    #[test]
    fn test_tensor_collection_order() {
        let a = Tensor::new(Value::zeros(&[1], DType::F32));
        let b = Tensor::new(Value::zeros(&[2], DType::F32));
        let args = CallArgs::new()
            .with_positional(a.clone())
            .with_keyword("extra", Arg::List(vec![Arg::Tensor(b.clone())]));
        let found = args.tensors();
        assert_eq!(found.len(), 2);
        assert!(found[0].same_as(&a));
        assert!(found[1].same_as(&b));
    }
}
