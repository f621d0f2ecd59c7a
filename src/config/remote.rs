//! Named, ordered set of asset library endpoints.
//!
//! Insertion order is priority order: resolution tries sources front to back.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const DEFAULT_REMOTE_NAME: &str = "origin";
pub const DEFAULT_REMOTE_URL: &str = "https://godotengine.org/asset-library/api";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSource {
    pub name: String,
    pub url: String,
    pub token: Option<String>,
}

impl RemoteSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteSources(Vec<RemoteSource>);

impl RemoteSources {
    pub fn with_default() -> Self {
        Self(vec![RemoteSource::new(DEFAULT_REMOTE_NAME, DEFAULT_REMOTE_URL)])
    }

    /// Insert or replace by name. Returns `true` when the name was new.
    ///
    /// A replaced source keeps its position in the priority order.
    pub fn add(&mut self, source: RemoteSource) -> bool {
        match self.0.iter_mut().find(|s| s.name == source.name) {
            Some(existing) => {
                *existing = source;
                false
            }
            None => {
                self.0.push(source);
                true
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<RemoteSource> {
        let index = self.0.iter().position(|s| s.name == name)?;
        Some(self.0.remove(index))
    }

    pub fn get(&self, name: &str) -> Option<&RemoteSource> {
        self.0.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RemoteSource> {
        self.0.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|s| s.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a RemoteSources {
    type Item = &'a RemoteSource;
    type IntoIter = std::slice::Iter<'a, RemoteSource>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// On-disk form of one entry: a bare URL, or an object when a token is attached
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RemoteEntry {
    Url(String),
    Full {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

impl Serialize for RemoteSources {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for source in &self.0 {
            let entry = match &source.token {
                None => RemoteEntry::Url(source.url.clone()),
                Some(token) => RemoteEntry::Full {
                    url: source.url.clone(),
                    token: Some(token.clone()),
                },
            };
            map.serialize_entry(&source.name, &entry)?;
        }
        map.end()
    }
}

struct RemoteSourcesVisitor;

impl<'de> Visitor<'de> for RemoteSourcesVisitor {
    type Value = RemoteSources;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("an object mapping remote names to URLs")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut sources = RemoteSources::default();
        while let Some((name, entry)) = access.next_entry::<String, RemoteEntry>()? {
            let (url, token) = match entry {
                RemoteEntry::Url(url) => (url, None),
                RemoteEntry::Full { url, token } => (url, token),
            };
            sources.add(RemoteSource { name, url, token });
        }
        Ok(sources)
    }
}

impl<'de> Deserialize<'de> for RemoteSources {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(RemoteSourcesVisitor)
    }
}
