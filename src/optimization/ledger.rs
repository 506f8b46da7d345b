use serde::{Deserialize, Serialize};

/// A single optimizer parameter group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub params: Vec<String>,
    pub lr: f64,
    pub weight_decay: f64,
}

impl ParamGroup {
    pub fn new<I, S>(params: I, lr: f64, weight_decay: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            lr,
            weight_decay,
        }
    }

    pub fn contains(&self, param: &str) -> bool {
        self.params.iter().any(|p| p == param)
    }
}

/// The scheduler's own record of every optimizer group, in construction order.
///
/// Optimizers only need to persist group hyperparameters; the composition
/// and order of the groups is rebuilt from this ledger on resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupLedger {
    groups: Vec<ParamGroup>,
}

impl GroupLedger {
    /// Creates a ledger mirroring `groups`.
    pub fn from_groups(groups: &[ParamGroup]) -> Self {
        Self {
            groups: groups.to_vec(),
        }
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub(crate) fn record(&mut self, group: ParamGroup) {
        self.groups.push(group);
    }

    /// Returns the index of the group holding `param`.
    pub fn group_of(&self, param: &str) -> Option<usize> {
        self.groups.iter().position(|group| group.contains(param))
    }

    pub fn contains_param(&self, param: &str) -> bool {
        self.group_of(param).is_some()
    }

    /// Every recorded parameter, group by group.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.groups
            .iter()
            .flat_map(|group| group.params.iter().map(String::as_str))
    }
}
