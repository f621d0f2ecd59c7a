use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AssetType {
    #[default]
    Any,
    Addon,
    Project,
}

impl AssetType {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetType::Any => "any",
            AssetType::Addon => "addon",
            AssetType::Project => "project",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SupportLevel {
    #[default]
    All,
    Official,
    Community,
    Testing,
}

impl SupportLevel {
    /// Value sent in the `support` query parameter. The asset library splits on spaces.
    pub fn query_value(self) -> &'static str {
        match self {
            SupportLevel::All => "official community testing",
            SupportLevel::Official => "official",
            SupportLevel::Community => "community",
            SupportLevel::Testing => "testing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SortKey {
    #[default]
    None,
    Rating,
    Cost,
    Name,
    Updated,
}

impl SortKey {
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            SortKey::None => None,
            SortKey::Rating => Some("rating"),
            SortKey::Cost => Some("cost"),
            SortKey::Name => Some("name"),
            SortKey::Updated => Some("updated"),
        }
    }
}

pub const DEFAULT_MAX_RESULTS: u32 = 20;

/// Search parameters for the asset list endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetQueryParams {
    pub asset_type: AssetType,
    pub category: Option<u32>,
    pub support: SupportLevel,
    pub filter: String,
    pub user: String,
    pub godot_version: String,
    pub max_results: u32,
    pub page: u32,
    pub sort: SortKey,
    pub reverse: bool,
}

impl Default for AssetQueryParams {
    fn default() -> Self {
        Self {
            asset_type: AssetType::Any,
            category: None,
            support: SupportLevel::All,
            filter: String::new(),
            user: String::new(),
            godot_version: String::new(),
            max_results: DEFAULT_MAX_RESULTS,
            page: 0,
            sort: SortKey::None,
            reverse: false,
        }
    }
}

impl AssetQueryParams {
    pub fn for_title(title: &str) -> Self {
        Self {
            filter: title.to_string(),
            ..Self::default()
        }
    }

    /// Canonical percent-encoded query string.
    ///
    /// Keys always appear in the same order; unset values are omitted.
    pub fn to_query_string(&self) -> String {
        let mut pairs: Vec<(&str, String)> = vec![("type", self.asset_type.as_str().to_string())];
        if let Some(category) = self.category.filter(|c| *c > 0) {
            pairs.push(("category", category.to_string()));
        }
        pairs.push(("support", self.support.query_value().to_string()));
        if !self.filter.is_empty() {
            pairs.push(("filter", self.filter.clone()));
        }
        if !self.user.is_empty() {
            pairs.push(("user", self.user.clone()));
        }
        if !self.godot_version.is_empty() {
            pairs.push(("godot_version", self.godot_version.clone()));
        }
        pairs.push(("max_results", self.max_results.to_string()));
        pairs.push(("page", self.page.to_string()));
        if let Some(sort) = self.sort.query_value() {
            pairs.push(("sort", sort.to_string()));
        }

        let mut query = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        if self.reverse {
            query.push_str("&reverse");
        }
        query
    }
}

/// One asset as returned by the asset library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub asset_id: String,
    pub title: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub author: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub support_level: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub cost: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub rating: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub godot_version: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub version: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub version_string: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub modify_date: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub download_url: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub download_hash: Option<String>,
}

impl AssetRecord {
    /// Version label used to detect remote changes
    pub fn version_label(&self) -> String {
        self.version_string
            .clone()
            .or_else(|| self.version.clone())
            .unwrap_or_default()
    }

    pub fn checksum(&self) -> Option<&str> {
        self.download_hash.as_deref().filter(|h| !h.trim().is_empty())
    }
}

/// Envelope of the asset list endpoint
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AssetListPage {
    pub result: Vec<AssetRecord>,
}

fn value_to_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(_) | serde_json::Value::Number(_) => {
            value_to_string(value).ok_or_else(|| serde::de::Error::custom("empty value"))
        }
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, found {other}"
        ))),
    }
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value_to_string(value))
}
