//! ComparatorStage: compares one document field against a constant.
//!
//! Numbers (and strings that parse as numbers) compare numerically, two
//! strings compare lexicographically, anything else only supports `==`/`!=`.
//! A missing field rejects.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::message::{lookup_path, MessageWrapper};
use crate::pipeline::stage::{FieldKind, FieldSchema, Stage, StageContext, StageOutcome};
use crate::pipeline::stages::parse_params;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;

pub static FIELDS: &[FieldSchema] = &[
    FieldSchema::required("key", FieldKind::String),
    FieldSchema::optional("operator", FieldKind::String, Some("=="))
        .one_of(&["==", "!=", ">", ">=", "<", "<=", "eq", "ne", "gt", "ge", "lt", "le"]),
    FieldSchema::required("value", FieldKind::Any),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Operator {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "==" | "eq" => Some(Operator::Eq),
            "!=" | "ne" => Some(Operator::Ne),
            ">" | "gt" => Some(Operator::Gt),
            ">=" | "ge" => Some(Operator::Ge),
            "<" | "lt" => Some(Operator::Lt),
            "<=" | "le" => Some(Operator::Le),
            _ => None,
        }
    }

    fn holds(self, ord: Ordering) -> bool {
        match self {
            Operator::Eq => ord == Ordering::Equal,
            Operator::Ne => ord != Ordering::Equal,
            Operator::Gt => ord == Ordering::Greater,
            Operator::Ge => ord != Ordering::Less,
            Operator::Lt => ord == Ordering::Less,
            Operator::Le => ord != Ordering::Greater,
        }
    }
}

fn default_operator() -> String {
    "==".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ComparatorConfig {
    key: String,
    #[serde(default = "default_operator")]
    operator: String,
    value: Value,
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Compare `lhs op rhs`. Returns false for incomparable pairs.
pub fn compare(lhs: &Value, op: Operator, rhs: &Value) -> bool {
    let ordering = match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => match (as_number(lhs), as_number(rhs)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => Some(a.cmp(b)),
        },
        _ => match (as_number(lhs), as_number(rhs)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    };
    match ordering {
        Some(ord) => op.holds(ord),
        None => match op {
            Operator::Eq => lhs == rhs,
            Operator::Ne => lhs != rhs,
            _ => false,
        },
    }
}

/// Field comparison stage.
#[derive(Debug)]
pub struct ComparatorStage {
    key: String,
    operator: Operator,
    value: Value,
}

impl ComparatorStage {
    pub fn new(key: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self {
            key: key.into(),
            operator,
            value,
        }
    }

    pub fn from_params(params: &Map<String, Value>) -> PipelineResult<Self> {
        let cfg: ComparatorConfig = parse_params(params)?;
        let operator = Operator::parse(&cfg.operator)
            .ok_or_else(|| PipelineError::Config(format!("unknown operator '{}'", cfg.operator)))?;
        Ok(Self::new(cfg.key, operator, cfg.value))
    }
}

impl Stage for ComparatorStage {
    fn type_name(&self) -> &'static str {
        "comparator"
    }

    fn process(
        &mut self,
        wrapper: &mut MessageWrapper,
        _ctx: &mut StageContext,
    ) -> PipelineResult<StageOutcome> {
        let doc = wrapper.working.as_document()?;
        let accepted = match lookup_path(doc, &self.key) {
            Some(found) => compare(found, self.operator, &self.value),
            None => false,
        };
        wrapper.set_accepted(accepted);
        Ok(StageOutcome::Done)
    }
}
