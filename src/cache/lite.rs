use serde::{Deserialize, Serialize};

use crate::core::{Record, Result};
use crate::index::KeyValueIndex;

/// 以人类可读 id 为键的投影前缀
pub const LITE_PREFIX: &str = "lite";
/// 以记录 id 为键的投影前缀
pub const ID_PREFIX: &str = "id";

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// 面向列表渲染的精简投影（写一次读多次，只能显式覆盖）
///
/// 字段名刻意压缩：KV 里可能有数十万条。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LitePage {
    #[serde(rename = "p", default, skip_serializing_if = "String::is_empty")]
    pub permalink: String,
    #[serde(rename = "t", default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(rename = "s", default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(rename = "d", default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "i", default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(rename = "t2", default, skip_serializing_if = "is_zero")]
    pub total_review_count: f64,
    #[serde(rename = "s2", default, skip_serializing_if = "String::is_empty")]
    pub stars_class: String,
    #[serde(rename = "p2", default, skip_serializing_if = "is_zero")]
    pub price: f64,
    #[serde(rename = "t3", default, skip_serializing_if = "is_false")]
    pub truncated: bool,
    #[serde(rename = "t4", default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(rename = "m", default, skip_serializing_if = "is_false")]
    pub master_variation: bool,
}

impl LitePage {
    /// 从记录投影；类型不符的参数直接忽略
    pub fn from_record(record: &Record) -> Self {
        let str_param = |k: &str| {
            record
                .param(k)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_default()
        };
        let num_param = |k: &str| record.param(k).and_then(|v| v.as_f64()).unwrap_or(0.0);

        Self {
            permalink: record.permalink.clone(),
            title: record.title.clone(),
            summary: record.content.summary.clone(),
            description: record.description.clone(),
            truncated: record.content.truncated,
            image: str_param("image"),
            total_review_count: num_param("total_review_count"),
            stars_class: str_param("stars_class"),
            price: num_param("price"),
            master_variation: record
                .param("master_variation")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            tags: record
                .param("tags")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
        }
    }
}

fn lite_key(prefix: &str, id: &str) -> String {
    format!("{}_{}", prefix, id)
}

/// 写入（覆盖）投影：`<prefix>_<id>`
pub fn put_lite_page(kv: &KeyValueIndex, prefix: &str, id: &str, page: &LitePage) -> Result<()> {
    kv.set(&lite_key(prefix, id), serde_json::to_string(page)?)
}

fn decode(kv: &KeyValueIndex, key: &str, raw: Option<String>) -> Option<LitePage> {
    let raw = raw.filter(|s| !s.is_empty())?;
    match serde_json::from_str(&raw) {
        Ok(page) => Some(page),
        Err(e) => {
            kv.note_corrupt(key, &e);
            None
        }
    }
}

pub fn lite_page_by_human_id(kv: &KeyValueIndex, human_id: &str) -> Option<LitePage> {
    let key = lite_key(LITE_PREFIX, human_id);
    decode(kv, &key, kv.get(&key))
}

pub fn lite_page_by_id(kv: &KeyValueIndex, id: &str) -> Option<LitePage> {
    let key = lite_key(ID_PREFIX, id);
    decode(kv, &key, kv.get(&key))
}

/// 批量读取；结果与输入对齐，缺失或损坏的位置为 None
pub fn lite_pages_by_ids<S: AsRef<str>>(kv: &KeyValueIndex, ids: &[S]) -> Vec<Option<LitePage>> {
    let keys: Vec<String> = ids.iter().map(|id| lite_key(ID_PREFIX, id.as_ref())).collect();
    kv.multi_get(&keys)
        .into_iter()
        .zip(keys.iter())
        .map(|(raw, key)| decode(kv, key, raw))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Kind;
    use serde_json::json;

    fn product() -> Record {
        let mut r = Record::new("p1", Kind::Regular)
            .with_title("Boots")
            .with_param("image", json!("/img/boots.png"))
            .with_param("price", json!(49.5))
            .with_param("tags", json!(["winter", 3, "leather"]))
            .with_param("master_variation", json!("yes"));
        r.permalink = "/boots/".into();
        r.content.truncated = true;
        r
    }

    #[test]
    fn projection_uses_compact_names() {
        let lite = LitePage::from_record(&product());
        assert_eq!(lite.tags, vec!["winter".to_string(), "leather".to_string()]);
        assert!(!lite.master_variation);

        let json = serde_json::to_string(&lite).unwrap();
        assert!(json.contains("\"p\":\"/boots/\""));
        assert!(json.contains("\"p2\":49.5"));
        assert!(json.contains("\"t3\":true"));
        assert!(!json.contains("\"s2\""));
        assert!(!json.contains("\"m\""));
    }

    #[test]
    fn readers_by_prefix_and_aligned_multi_get() {
        let kv = KeyValueIndex::default();
        let lite = LitePage::from_record(&product());
        put_lite_page(&kv, LITE_PREFIX, "boots", &lite).unwrap();
        put_lite_page(&kv, ID_PREFIX, "p1", &lite).unwrap();
        kv.set("id_bad", "{".into()).unwrap();

        assert_eq!(lite_page_by_human_id(&kv, "boots"), Some(lite.clone()));
        assert_eq!(lite_page_by_id(&kv, "p1"), Some(lite.clone()));
        assert_eq!(lite_page_by_id(&kv, "boots"), None);

        let got = lite_pages_by_ids(&kv, &["p1", "missing", "bad"]);
        assert_eq!(got, vec![Some(lite), None, None]);
        assert_eq!(kv.corrupt_entries(), 1);
    }
}
