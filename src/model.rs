use std::{collections::HashMap, fs, path::Path};

use serde::Deserialize;

use crate::error::{FtsErr, Result};

/// The model collaborator: a tree of named parameters addressed by dotted paths.
///
/// Names must be stable across save/load, `layer.0.weight` belongs to module `layer.0`.
pub trait ParamTree {
    /// A human readable name, used to name generated schedule files.
    fn name(&self) -> &str;

    /// Every parameter as `(name, trainable)`, in discovery order from input to output.
    fn named_parameters(&self) -> Vec<(String, bool)>;

    /// Enables or disables gradient computation for a single parameter.
    ///
    /// # Errors
    /// Returns `FtsErr::UnknownParameter` if `name` is not part of the tree.
    fn set_trainable(&mut self, name: &str, trainable: bool) -> Result<()>;
}

/// Returns the parameter names of `model` in discovery order.
pub fn param_names(model: &dyn ParamTree) -> Vec<String> {
    model
        .named_parameters()
        .into_iter()
        .map(|(name, _)| name)
        .collect()
}

/// Returns the dotted module path owning `param`, `""` for root parameters.
pub fn module_path(param: &str) -> &str {
    param.rsplit_once('.').map_or("", |(module, _)| module)
}

/// An in-memory `ParamTree`, enough to drive the scheduler without a tensor library.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedParams {
    name: String,
    params: Vec<(String, bool)>,
    index: HashMap<String, usize>,
}

/// A model description, either named or a bare list of parameter names.
#[derive(Deserialize)]
#[serde(untagged)]
enum ModelFile {
    Named {
        name: String,
        parameters: Vec<String>,
    },
    Bare(Vec<String>),
}

impl NamedParams {
    /// Creates a new `NamedParams`, every parameter starts trainable.
    ///
    /// # Arguments
    /// * `name` - The model's name.
    /// * `params` - Parameter names in discovery order.
    ///
    /// # Returns
    /// A new `NamedParams` instance.
    pub fn new<I, S>(name: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let params: Vec<(String, bool)> = params.into_iter().map(|p| (p.into(), true)).collect();
        let index = params
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), i))
            .collect();

        Self {
            name: name.into(),
            params,
            index,
        }
    }

    /// Loads a model description from a JSON file, either
    /// `{"name": "...", "parameters": ["layer.0.weight", ...]}` or a bare
    /// list of parameter names. A bare list takes the file stem as its name.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        match serde_json::from_str(&content)? {
            ModelFile::Named { name, parameters } => Ok(Self::new(name, parameters)),
            ModelFile::Bare(parameters) => {
                let name = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "model".to_string());
                Ok(Self::new(name, parameters))
            }
        }
    }

    /// Returns whether `name` is trainable, `None` if it does not exist.
    pub fn is_trainable(&self, name: &str) -> Option<bool> {
        self.index.get(name).map(|&i| self.params[i].1)
    }

    /// Returns the names of every trainable parameter in discovery order.
    pub fn trainable(&self) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(_, trainable)| *trainable)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl ParamTree for NamedParams {
    fn name(&self) -> &str {
        &self.name
    }

    fn named_parameters(&self) -> Vec<(String, bool)> {
        self.params.clone()
    }

    fn set_trainable(&mut self, name: &str, trainable: bool) -> Result<()> {
        let &i = self.index.get(name).ok_or_else(|| FtsErr::UnknownParameter {
            name: name.to_string(),
        })?;

        self.params[i].1 = trainable;
        Ok(())
    }
}
