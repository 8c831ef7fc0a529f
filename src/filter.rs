//! MongoDB-style metadata filter evaluation.
//!
//! A filter is a small closed DSL over document attributes, parsed once per
//! query into a [`FilterNode`] tree and evaluated in memory against each
//! candidate document. Keeping the grammar closed makes it portable across
//! storage backends and makes operator smuggling impossible by construction.
//!
//! Supported operators: `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`,
//! `$nin`, `$all`, `$exists`, `$and`, `$or`, `$nor`, `$not`.
//!
//! Implicit forms: `{k: v}` with a scalar `v` means `{k: {"$eq": v}}`;
//! sibling keys in one mapping are an implicit `$and`.
//!
//! A handful of **column fields** (`uploaded_by`, `filename`, `file_type`,
//! `keywords`, `token_count`, `uploaded_at`) resolve against first-class
//! document attributes; every other field resolves against the uploader's
//! metadata map.
//!
//! Evaluation never fails: a type-mismatched comparison is simply false for
//! that document. Parsing fails on unknown operators (`InvalidFilter`).

use serde_json::Value;

use crate::error::{RagError, Result};

/// Parsed filter tree.
#[derive(Debug, Clone)]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Nor(Vec<FilterNode>),
    Not(Box<FilterNode>),
    Cmp {
        field: String,
        op: CmpOp,
        value: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    All,
    Exists,
}

/// Document attributes a filter can see. Column fields are first-class;
/// everything else lives in `metadata`.
#[derive(Debug, Clone)]
pub struct FilterDoc<'a> {
    pub uploaded_by: &'a str,
    pub filename: &'a str,
    pub file_type: &'a str,
    pub uploaded_at: &'a str,
    pub keywords: &'a [String],
    pub token_count: Option<i64>,
    pub metadata: &'a Value,
}

/// Parse a filter tree from its JSON form.
pub fn parse_filter(value: &Value) -> Result<FilterNode> {
    let map = value.as_object().ok_or_else(|| {
        RagError::InvalidFilter("filter must be a JSON object".to_string())
    })?;

    let mut clauses = Vec::with_capacity(map.len());

    for (key, val) in map {
        match key.as_str() {
            "$and" => clauses.push(FilterNode::And(parse_clause_array(key, val)?)),
            "$or" => clauses.push(FilterNode::Or(parse_clause_array(key, val)?)),
            "$nor" => clauses.push(FilterNode::Nor(parse_clause_array(key, val)?)),
            "$not" => clauses.push(FilterNode::Not(Box::new(parse_filter(val)?))),
            op if op.starts_with('$') => {
                return Err(RagError::InvalidFilter(format!(
                    "unknown top-level operator: {}",
                    op
                )));
            }
            field => clauses.push(parse_field_clause(field, val)?),
        }
    }

    Ok(match clauses.len() {
        0 => FilterNode::And(Vec::new()),
        1 => clauses.pop().unwrap(),
        _ => FilterNode::And(clauses),
    })
}

fn parse_clause_array(op: &str, value: &Value) -> Result<Vec<FilterNode>> {
    let items = value.as_array().ok_or_else(|| {
        RagError::InvalidFilter(format!("{} expects an array of clauses", op))
    })?;
    if items.is_empty() {
        return Err(RagError::InvalidFilter(format!(
            "{} expects a non-empty array",
            op
        )));
    }
    items.iter().map(parse_filter).collect()
}

fn parse_field_clause(field: &str, value: &Value) -> Result<FilterNode> {
    match value {
        // {field: {"$op": operand, ...}} is an operator object.
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            let mut clauses = Vec::with_capacity(ops.len());
            for (op_name, operand) in ops {
                let op = match op_name.as_str() {
                    "$eq" => CmpOp::Eq,
                    "$ne" => CmpOp::Ne,
                    "$gt" => CmpOp::Gt,
                    "$gte" => CmpOp::Gte,
                    "$lt" => CmpOp::Lt,
                    "$lte" => CmpOp::Lte,
                    "$in" => CmpOp::In,
                    "$nin" => CmpOp::Nin,
                    "$all" => CmpOp::All,
                    "$exists" => CmpOp::Exists,
                    other => {
                        return Err(RagError::InvalidFilter(format!(
                            "unknown operator '{}' for field '{}'",
                            other, field
                        )));
                    }
                };

                if matches!(op, CmpOp::In | CmpOp::Nin | CmpOp::All) && !operand.is_array() {
                    return Err(RagError::InvalidFilter(format!(
                        "{} expects an array operand",
                        op_name
                    )));
                }
                if op == CmpOp::Exists && !operand.is_boolean() {
                    return Err(RagError::InvalidFilter(
                        "$exists expects a boolean operand".to_string(),
                    ));
                }

                clauses.push(FilterNode::Cmp {
                    field: field.to_string(),
                    op,
                    value: operand.clone(),
                });
            }
            Ok(match clauses.len() {
                1 => clauses.pop().unwrap(),
                _ => FilterNode::And(clauses),
            })
        }
        // {field: scalar} is an implicit $eq.
        other => Ok(FilterNode::Cmp {
            field: field.to_string(),
            op: CmpOp::Eq,
            value: other.clone(),
        }),
    }
}

impl FilterNode {
    /// Evaluate this filter against a document. Never fails: mismatched
    /// types make the affected comparison false.
    pub fn matches(&self, doc: &FilterDoc<'_>) -> bool {
        match self {
            FilterNode::And(clauses) => clauses.iter().all(|c| c.matches(doc)),
            FilterNode::Or(clauses) => clauses.iter().any(|c| c.matches(doc)),
            FilterNode::Nor(clauses) => !clauses.iter().any(|c| c.matches(doc)),
            FilterNode::Not(inner) => !inner.matches(doc),
            FilterNode::Cmp { field, op, value } => {
                let resolved = resolve_field(doc, field);
                eval_cmp(resolved.as_ref(), *op, value)
            }
        }
    }
}

/// Column fields resolve against document attributes; all other names look
/// up the uploader metadata map.
fn resolve_field(doc: &FilterDoc<'_>, field: &str) -> Option<Value> {
    match field {
        "uploaded_by" => Some(Value::String(doc.uploaded_by.to_string())),
        "filename" => Some(Value::String(doc.filename.to_string())),
        "file_type" => Some(Value::String(doc.file_type.to_string())),
        "uploaded_at" | "created_at" => Some(Value::String(doc.uploaded_at.to_string())),
        "keywords" => Some(Value::Array(
            doc.keywords
                .iter()
                .map(|k| Value::String(k.clone()))
                .collect(),
        )),
        "token_count" => doc.token_count.map(|n| Value::Number(n.into())),
        _ => doc.metadata.get(field).cloned(),
    }
}

fn eval_cmp(actual: Option<&Value>, op: CmpOp, operand: &Value) -> bool {
    match op {
        CmpOp::Exists => {
            let wanted = operand.as_bool().unwrap_or(false);
            actual.is_some() == wanted
        }
        CmpOp::Eq => actual.map(|a| values_eq(a, operand)).unwrap_or(false),
        CmpOp::Ne => !actual.map(|a| values_eq(a, operand)).unwrap_or(false),
        CmpOp::Gt | CmpOp::Gte | CmpOp::Lt | CmpOp::Lte => {
            let Some(actual) = actual else { return false };
            let Some(ordering) = compare_values(actual, operand) else {
                return false;
            };
            match op {
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Gte => ordering.is_ge(),
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Lte => ordering.is_le(),
                _ => unreachable!(),
            }
        }
        CmpOp::In => {
            let Some(actual) = actual else { return false };
            let Some(candidates) = operand.as_array() else {
                return false;
            };
            match actual {
                // Array field: any element in the candidate set.
                Value::Array(elements) => elements
                    .iter()
                    .any(|e| candidates.iter().any(|c| values_eq(e, c))),
                scalar => candidates.iter().any(|c| values_eq(scalar, c)),
            }
        }
        CmpOp::Nin => !eval_cmp(actual, CmpOp::In, operand),
        CmpOp::All => {
            let Some(Value::Array(elements)) = actual else {
                return false;
            };
            let Some(required) = operand.as_array() else {
                return false;
            };
            required
                .iter()
                .all(|r| elements.iter().any(|e| values_eq(e, r)))
        }
    }
}

/// Equality with numeric coercion (1 == 1.0); otherwise strict JSON
/// equality.
fn values_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordered comparison: numeric when both sides are numbers, lexicographic
/// when both are strings (which orders ISO-8601 timestamps correctly).
/// Mixed types are incomparable.
fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_with_metadata(metadata: &Value) -> FilterDoc<'_> {
        FilterDoc {
            uploaded_by: "alice@example.com",
            filename: "report.pdf",
            file_type: "application/pdf",
            uploaded_at: "2026-03-01T12:00:00Z",
            keywords: &[],
            token_count: Some(1200),
            metadata,
        }
    }

    fn matches(filter: &Value, metadata: &Value) -> bool {
        let node = parse_filter(filter).unwrap();
        node.matches(&doc_with_metadata(metadata))
    }

    #[test]
    fn implicit_eq_on_scalar() {
        let meta = json!({"department": "legal"});
        assert!(matches(&json!({"department": "legal"}), &meta));
        assert!(!matches(&json!({"department": "finance"}), &meta));
    }

    #[test]
    fn implicit_and_for_sibling_keys() {
        let meta = json!({"department": "legal", "priority": 2});
        assert!(matches(&json!({"department": "legal", "priority": 2}), &meta));
        assert!(!matches(&json!({"department": "legal", "priority": 3}), &meta));
    }

    #[test]
    fn missing_field_fails_eq_but_passes_ne() {
        let meta = json!({});
        assert!(!matches(&json!({"department": "legal"}), &meta));
        assert!(matches(&json!({"department": {"$ne": "legal"}}), &meta));
    }

    #[test]
    fn ordered_comparisons_on_numbers() {
        let meta = json!({"priority": 5});
        assert!(matches(&json!({"priority": {"$gt": 4}}), &meta));
        assert!(matches(&json!({"priority": {"$gte": 5}}), &meta));
        assert!(matches(&json!({"priority": {"$lt": 6}}), &meta));
        assert!(!matches(&json!({"priority": {"$lte": 4}}), &meta));
    }

    #[test]
    fn ordered_comparisons_on_iso_dates() {
        let meta = json!({"due": "2026-02-01"});
        assert!(matches(&json!({"due": {"$gte": "2026-01-01"}}), &meta));
        assert!(!matches(&json!({"due": {"$gte": "2026-03-01"}}), &meta));
    }

    #[test]
    fn type_mismatch_fails_closed() {
        let meta = json!({"priority": "high"});
        // String vs number comparison: false, never an error.
        assert!(!matches(&json!({"priority": {"$gt": 3}}), &meta));
    }

    #[test]
    fn in_matches_scalars_and_array_fields() {
        let scalar_meta = json!({"department": "legal"});
        assert!(matches(
            &json!({"department": {"$in": ["legal", "finance"]}}),
            &scalar_meta
        ));

        let array_meta = json!({"tags": ["legal", "q4"]});
        assert!(matches(&json!({"tags": {"$in": ["legal"]}}), &array_meta));
        assert!(!matches(&json!({"tags": {"$in": ["finance"]}}), &array_meta));
    }

    #[test]
    fn nin_is_the_negation_of_in() {
        let meta = json!({"tags": ["legal"]});
        assert!(!matches(&json!({"tags": {"$nin": ["legal"]}}), &meta));
        assert!(matches(&json!({"tags": {"$nin": ["finance"]}}), &meta));
    }

    #[test]
    fn all_requires_every_value() {
        let meta = json!({"tags": ["legal", "finance", "q4"]});
        assert!(matches(&json!({"tags": {"$all": ["legal", "finance"]}}), &meta));
        assert!(!matches(&json!({"tags": {"$all": ["legal", "archived"]}}), &meta));
        // Non-array field never satisfies $all.
        let scalar = json!({"tags": "legal"});
        assert!(!matches(&json!({"tags": {"$all": ["legal"]}}), &scalar));
    }

    #[test]
    fn exists_checks_presence() {
        let meta = json!({"department": "legal"});
        assert!(matches(&json!({"department": {"$exists": true}}), &meta));
        assert!(!matches(&json!({"department": {"$exists": false}}), &meta));
        assert!(matches(&json!({"missing": {"$exists": false}}), &meta));
    }

    #[test]
    fn logical_combinators() {
        let meta = json!({"department": "legal", "status": "active"});
        assert!(matches(
            &json!({"$and": [{"department": "legal"}, {"status": "active"}]}),
            &meta
        ));
        assert!(matches(
            &json!({"$or": [{"department": "finance"}, {"status": "active"}]}),
            &meta
        ));
        assert!(matches(
            &json!({"$nor": [{"department": "finance"}, {"status": "archived"}]}),
            &meta
        ));
        assert!(!matches(&json!({"$not": {"department": "legal"}}), &meta));
    }

    #[test]
    fn spec_scenario_legal_without_full_finance() {
        // Three documents tagged [legal], [finance], [legal, finance]; the
        // filter must select only the first.
        let filter = json!({"$and": [
            {"tags": {"$in": ["legal"]}},
            {"$not": {"tags": {"$all": ["finance"]}}}
        ]});

        let legal = json!({"tags": ["legal"]});
        let finance = json!({"tags": ["finance"]});
        let both = json!({"tags": ["legal", "finance"]});

        assert!(matches(&filter, &legal));
        assert!(!matches(&filter, &finance));
        assert!(!matches(&filter, &both));
    }

    #[test]
    fn column_fields_resolve_against_document_attributes() {
        let meta = json!({});
        let filter = parse_filter(&json!({"uploaded_by": "alice@example.com"})).unwrap();
        assert!(filter.matches(&doc_with_metadata(&meta)));

        let filter = parse_filter(&json!({"token_count": {"$gte": 1000}})).unwrap();
        assert!(filter.matches(&doc_with_metadata(&meta)));

        let filter = parse_filter(&json!({"uploaded_at": {"$gte": "2026-01-01"}})).unwrap();
        assert!(filter.matches(&doc_with_metadata(&meta)));
    }

    #[test]
    fn keywords_column_supports_in_and_all() {
        let meta = json!({});
        let keywords = vec!["kubernetes".to_string(), "deployment".to_string()];
        let doc = FilterDoc {
            keywords: &keywords,
            ..doc_with_metadata(&meta)
        };

        let filter = parse_filter(&json!({"keywords": {"$in": ["kubernetes"]}})).unwrap();
        assert!(filter.matches(&doc));

        let filter = parse_filter(&json!({"keywords": {"$all": ["kubernetes", "helm"]}})).unwrap();
        assert!(!filter.matches(&doc));
    }

    #[test]
    fn unknown_operator_is_rejected_at_parse_time() {
        let err = parse_filter(&json!({"field": {"$regex": "x"}})).unwrap_err();
        assert!(matches!(err, RagError::InvalidFilter(_)));

        let err = parse_filter(&json!({"$xor": [{"a": 1}]})).unwrap_err();
        assert!(matches!(err, RagError::InvalidFilter(_)));
    }

    #[test]
    fn malformed_operands_are_rejected_at_parse_time() {
        assert!(parse_filter(&json!({"tags": {"$in": "legal"}})).is_err());
        assert!(parse_filter(&json!({"tags": {"$exists": "yes"}})).is_err());
        assert!(parse_filter(&json!({"$and": []})).is_err());
        assert!(parse_filter(&json!("just a string")).is_err());
    }

    #[test]
    fn numeric_coercion_in_equality() {
        let meta = json!({"version": 2});
        assert!(matches(&json!({"version": 2.0}), &meta));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let meta = json!({});
        assert!(matches(&json!({}), &meta));
    }
}
