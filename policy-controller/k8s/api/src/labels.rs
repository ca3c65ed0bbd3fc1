use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc};

#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

/// A set-based requirement. The operator is kept as written so that it
/// renders back the way the policy author spelled it.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Expression {
    pub key: String,
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects a set of objects by their labels.
///
/// Policy objects spell the expression list `matchExpression`; Kubernetes
/// objects spell it `matchExpressions`. Both are accepted.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    match_labels: Option<Map>,
    #[serde(
        default,
        rename = "matchExpression",
        alias = "matchExpressions",
        skip_serializing_if = "Option::is_none"
    )]
    match_expressions: Option<Expressions>,
}

// === Selector ===

impl Selector {
    pub fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    pub fn new(map: Map, exprs: Expressions) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: Some(exprs),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.iter().all(|m| m.is_empty())
            && self.match_expressions.iter().all(|e| e.is_empty())
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels.as_ref()) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels.iter() {
                if labels.0.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }

    /// Renders the selector in the syntax the Kubernetes API accepts for the
    /// `labelSelector` list parameter, which spells set operators in lower
    /// case and existence checks as `key` and `!key`.
    pub fn to_query(&self) -> String {
        let labels = self
            .match_labels
            .iter()
            .flatten()
            .map(|(k, v)| format!("{k}={v}"));
        let exprs = self
            .match_expressions
            .iter()
            .flatten()
            .map(Expression::to_query);
        labels.chain(exprs).collect::<Vec<_>>().join(",")
    }
}

/// Renders the canonical selector string: `key=value` constraints in key
/// order, then each expression as `key operator (values)` with the operator
/// as written. An empty selector renders as an empty string.
impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.match_labels.iter().flatten() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{k}={v}")?;
        }

        for expr in self.match_expressions.iter().flatten() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            fmt::Display::fmt(expr, f)?;
        }

        Ok(())
    }
}

impl From<&metav1::LabelSelector> for Selector {
    fn from(selector: &metav1::LabelSelector) -> Self {
        let exprs = selector.match_expressions.as_ref().map(|exprs| {
            exprs
                .iter()
                .map(|req| Expression {
                    key: req.key.clone(),
                    operator: req.operator.clone(),
                    values: req.values.clone().unwrap_or_default(),
                })
                .collect()
        });
        Self {
            match_labels: selector.match_labels.clone(),
            match_expressions: exprs,
        }
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

// === Labels ===

impl Labels {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === Expression ===

impl Expression {
    pub fn new(key: impl ToString, operator: impl ToString, values: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            operator: operator.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Returns the recognized operator, if any.
    pub fn op(&self) -> Option<Operator> {
        self.operator.parse().ok()
    }

    fn to_query(&self) -> String {
        let values = self.values.join(",");
        match self.op() {
            Some(Operator::In) => format!("{} in ({values})", self.key),
            Some(Operator::NotIn) => format!("{} notin ({values})", self.key),
            Some(Operator::Exists) => self.key.clone(),
            Some(Operator::DoesNotExist) => format!("!{}", self.key),
            None => self.to_string(),
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        match self.op() {
            Some(Operator::In) => {
                if let Some(v) = labels.get(&self.key) {
                    return self.values.contains(v);
                }
            }
            Some(Operator::NotIn) => {
                return match labels.get(&self.key) {
                    Some(v) => !self.values.contains(v),
                    None => true,
                }
            }
            Some(Operator::Exists) => return labels.contains_key(&self.key),
            Some(Operator::DoesNotExist) => return !labels.contains_key(&self.key),
            None => {}
        }

        false
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.key,
            self.operator,
            self.values.join(",")
        )
    }
}

// === Operator ===

impl std::str::FromStr for Operator {
    type Err = UnknownOperator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("in") {
            return Ok(Self::In);
        }
        if s.eq_ignore_ascii_case("notin") {
            return Ok(Self::NotIn);
        }
        if s.eq_ignore_ascii_case("exists") {
            return Ok(Self::Exists);
        }
        if s.eq_ignore_ascii_case("doesnotexist") {
            return Ok(Self::DoesNotExist);
        }
        Err(UnknownOperator(s.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown selector operator: {0}")]
pub struct UnknownOperator(String);
