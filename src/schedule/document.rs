use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::{Path, PathBuf},
};

use serde::{
    de::{MapAccess, Visitor},
    Deserialize, Deserializer, Serialize,
};
use serde_yaml::Value;

use crate::error::{FtsErr, Result};

/// One phase as written in a schedule file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub params: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_transition_epoch: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lr: Option<f64>,
}

impl PhaseSpec {
    pub fn new<I, S>(params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            max_transition_epoch: None,
            lr: None,
        }
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = Some(lr);
        self
    }

    pub fn with_max_transition_epoch(mut self, epoch: i64) -> Self {
        self.max_transition_epoch = Some(epoch);
        self
    }
}

/// A depth-indexed schedule document.
///
/// Serializes as a YAML mapping from integer depth to phase, keeping the
/// `params` order of every phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleDocument {
    phases: BTreeMap<usize, PhaseSpec>,
}

impl ScheduleDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, depth: usize, phase: PhaseSpec) -> Option<PhaseSpec> {
        self.phases.insert(depth, phase)
    }

    pub fn remove(&mut self, depth: usize) -> Option<PhaseSpec> {
        self.phases.remove(&depth)
    }

    pub fn get(&self, depth: usize) -> Option<&PhaseSpec> {
        self.phases.get(&depth)
    }

    pub fn get_mut(&mut self, depth: usize) -> Option<&mut PhaseSpec> {
        self.phases.get_mut(&depth)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &PhaseSpec)> {
        self.phases.iter().map(|(&depth, phase)| (depth, phase))
    }

    /// Parses a document without validating it against a model.
    ///
    /// # Errors
    /// Returns `FtsErr::Yaml` if `text` is not a depth to phase mapping.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Reads a document from `path`, see `from_yaml_str`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = read_schedule(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Writes the document to `path`, creating missing parent directories.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, self.to_yaml_string()?)?;
        Ok(())
    }
}

/// A schedule document exactly as written: every top-level entry in file
/// order, duplicated and non-integer keys included, so validation can
/// report them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSchedule {
    entries: Vec<(Value, Value)>,
}

impl RawSchedule {
    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses the top-level mapping of a schedule document.
    ///
    /// # Errors
    /// Returns `FtsErr::MalformedSchedule` if `text` is empty or not a mapping.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(FtsErr::MalformedSchedule {
                detail: "the schedule document is empty".into(),
            });
        }

        serde_yaml::from_str(text).map_err(|e| FtsErr::MalformedSchedule {
            detail: e.to_string(),
        })
    }

    /// Reads and parses `path`.
    ///
    /// # Errors
    /// Returns `FtsErr::ScheduleNotFound` if `path` does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = read_schedule(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Captures an in-memory document.
    pub fn from_document(doc: &ScheduleDocument) -> Result<Self> {
        match serde_yaml::to_value(doc)? {
            Value::Mapping(mapping) => Ok(Self {
                entries: mapping.into_iter().collect(),
            }),
            _ => Err(FtsErr::MalformedSchedule {
                detail: "the schedule document is not a mapping".into(),
            }),
        }
    }
}

impl<'de> Deserialize<'de> for RawSchedule {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = RawSchedule;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping from depth to phase")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<RawSchedule, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<Value, Value>()? {
                    entries.push(entry);
                }

                Ok(RawSchedule { entries })
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

fn read_schedule(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => FtsErr::ScheduleNotFound {
            path: PathBuf::from(path),
        },
        _ => FtsErr::Io(e),
    })
}
