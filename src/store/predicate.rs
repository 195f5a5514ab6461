use crate::core::{Kind, Record, RecordId};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

/// Predicate 抽象接口：决定一条记录是否进入查询结果
pub trait Predicate: Send + Sync {
    fn matches(&self, record: &Record) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Record) -> bool + Send + Sync,
{
    fn matches(&self, record: &Record) -> bool {
        self(record)
    }
}

/// 全部匹配
pub struct All;

impl Predicate for All {
    fn matches(&self, _record: &Record) -> bool {
        true
    }
}

/// 按 Kind 匹配（可多选）
pub struct KindIn(pub Vec<Kind>);

impl KindIn {
    pub fn one(kind: Kind) -> Self {
        Self(vec![kind])
    }
}

impl Predicate for KindIn {
    fn matches(&self, record: &Record) -> bool {
        self.0.contains(&record.kind)
    }
}

/// 参数等值匹配（`params.<key> == value`）
pub struct ParamEquals {
    key: String,
    value: serde_json::Value,
}

impl ParamEquals {
    pub fn new(key: &str, value: serde_json::Value) -> Self {
        Self {
            key: key.to_string(),
            value,
        }
    }
}

impl Predicate for ParamEquals {
    fn matches(&self, record: &Record) -> bool {
        record.params.get(&self.key) == Some(&self.value)
    }
}

/// 参数属于集合（`params.<key> in [...]`，仅字符串值）
pub struct ParamIn {
    key: String,
    values: HashSet<String>,
}

impl ParamIn {
    pub fn new<S: AsRef<str>>(key: &str, values: &[S]) -> Self {
        Self {
            key: key.to_string(),
            values: values.iter().map(|v| v.as_ref().to_string()).collect(),
        }
    }
}

impl Predicate for ParamIn {
    fn matches(&self, record: &Record) -> bool {
        record
            .params
            .get(&self.key)
            .and_then(|v| v.as_str())
            .map(|s| self.values.contains(s))
            .unwrap_or(false)
    }
}

pub struct IdIn(pub HashSet<RecordId>);

impl Predicate for IdIn {
    fn matches(&self, record: &Record) -> bool {
        self.0.contains(&record.id)
    }
}

/// 排序键
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SortKey {
    StoragePath,
    Id,
    Param(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sort {
    pub key: SortKey,
    pub descending: bool,
}

impl Sort {
    pub fn asc(key: SortKey) -> Self {
        Self {
            key,
            descending: false,
        }
    }

    pub fn desc(key: SortKey) -> Self {
        Self {
            key,
            descending: true,
        }
    }

    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let ord = match &self.key {
            SortKey::StoragePath => a.storage_path.cmp(&b.storage_path),
            SortKey::Id => a.id.cmp(&b.id),
            SortKey::Param(name) => compare_values(a.params.get(name), b.params.get(name)),
        };
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }
}

/// 参数值比较：缺失 < bool < 数字 < 字符串；其他类型视为相等
fn compare_values(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> Ordering {
    use serde_json::Value;

    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

pub fn all() -> Arc<dyn Predicate> {
    Arc::new(All)
}

pub fn kind(kind: Kind) -> Arc<dyn Predicate> {
    Arc::new(KindIn::one(kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn param_sort_orders_numbers_before_strings() {
        let a = Record::new("a", Kind::Regular).with_param("w", json!(2));
        let b = Record::new("b", Kind::Regular).with_param("w", json!(10));
        let c = Record::new("c", Kind::Regular).with_param("w", json!("x"));
        let d = Record::new("d", Kind::Regular);

        let mut v = vec![c.clone(), b.clone(), d.clone(), a.clone()];
        let s = Sort::asc(SortKey::Param("w".into()));
        v.sort_by(|x, y| s.compare(x, y));
        let ids: Vec<_> = v.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "a", "b", "c"]);

        let s = Sort::desc(SortKey::Param("w".into()));
        v.sort_by(|x, y| s.compare(x, y));
        assert_eq!(v[0].id.as_str(), "c");
    }

    #[test]
    fn closures_are_predicates() {
        let p = |r: &Record| r.sections.len() == 2;
        let r = Record::new("x", Kind::Regular).with_sections(&["a", "b"]);
        assert!(p.matches(&r));
        assert!(ParamIn::new("page_human_id", &["h1"]).matches(&r.clone().with_param("page_human_id", json!("h1"))));
        assert!(!KindIn::one(Kind::Section).matches(&r));
    }
}
