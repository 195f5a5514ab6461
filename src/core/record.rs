use serde::{Deserialize, Serialize};
use std::fmt;
use unicode_normalization::UnicodeNormalization;

/// 参数表：front matter 里的自由字段（对存储核心不透明）
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Record 全局唯一 ID（一次分配，永不复用）
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 生成确定性 ID：`<kind>_<part>_<part>...`
    pub fn generate(kind: Kind, parts: &[String]) -> Self {
        let mut id = String::from(kind.as_str());
        id.push('_');
        id.push_str(&parts.join("_"));
        Self(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Home,
    Section,
    /// 某个 term 的列表页（taxonomy term）
    TermList,
    /// term 分组本身（taxonomy）
    TermGroup,
    Regular,
    Headless,
    Other,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Home => "home",
            Kind::Section => "section",
            Kind::TermList => "term_list",
            Kind::TermGroup => "term_group",
            Kind::Regular => "regular",
            Kind::Headless => "headless",
            Kind::Other => "other",
        }
    }

    /// 只有 Home / Section 拥有子节点列表
    pub fn is_node(&self) -> bool {
        matches!(self, Kind::Home | Kind::Section)
    }
}

/// 内容与渲染载荷（对核心不透明）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Content {
    pub raw: String,
    pub rendered: String,
    pub summary: String,
    pub table_of_contents: String,
    pub truncated: bool,
}

/// 页面记录
///
/// 邻接边（`page_ids` / `subsection_ids`）不随主文档存储：
/// 从 DocumentStore 读出的 Record 这两个字段为空，需显式从 KeyValueIndex hydrate。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub kind: Kind,
    #[serde(default)]
    pub sections: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub page_ids: Vec<RecordId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsection_ids: Vec<RecordId>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub content: Content,
    /// 仅用于组装时排序，不决定归属
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_path: String,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, kind: Kind) -> Self {
        Self {
            id: id.into(),
            kind,
            sections: Vec::new(),
            parent_id: None,
            page_ids: Vec::new(),
            subsection_ids: Vec::new(),
            title: String::new(),
            permalink: String::new(),
            description: String::new(),
            params: Params::new(),
            content: Content::default(),
            storage_path: String::new(),
        }
    }

    pub fn with_sections<S: AsRef<str>>(mut self, sections: &[S]) -> Self {
        self.sections = sections.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key).filter(|v| !v.is_null())
    }

    pub fn human_id(&self) -> Option<&str> {
        self.param(HUMAN_ID_PARAM).and_then(|v| v.as_str())
    }

    /// section 路径键：`a/b/c`
    pub fn section_key(&self) -> String {
        section_key(&self.sections)
    }

    /// 取走邻接边（写入 KV 前从主文档剥离）
    pub fn take_adjacency(&mut self) -> (Vec<RecordId>, Vec<RecordId>) {
        (
            std::mem::take(&mut self.page_ids),
            std::mem::take(&mut self.subsection_ids),
        )
    }
}

pub const HUMAN_ID_PARAM: &str = "page_human_id";

pub fn section_key<S: AsRef<str>>(sections: &[S]) -> String {
    let mut out = String::new();
    for (i, s) in sections.iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(s.as_ref());
    }
    out
}

/// 路径段统一为 NFC，避免同一 section 以不同组合形式出现两次
pub fn normalize_segment(segment: &str) -> String {
    segment.nfc().collect()
}

/// 路径段合法性：非空，不含 `/`，不含控制字符（排序标记依赖这一点）
pub fn valid_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains('/') && !segment.chars().any(|c| c.is_control())
}
