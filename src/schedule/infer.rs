use std::collections::HashMap;

use log::debug;

use super::{Phase, Schedule};
use crate::{
    error::Result,
    model::{module_path, ParamTree},
};

/// Infers a default schedule from `model`.
///
/// Parameters are walked from the output end toward the input end and
/// grouped by the module that directly owns them, one phase per module.
/// A parent module holding its own parameters gets its own phase beside its
/// children's phases. Depth 0 is the module closest to the output.
///
/// # Errors
/// Returns `FtsErr::MalformedSchedule` if the model has no parameters.
pub fn infer_schedule(model: &dyn ParamTree) -> Result<Schedule> {
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut by_module: HashMap<String, usize> = HashMap::new();

    for (name, _) in model.named_parameters().into_iter().rev() {
        let module = module_path(&name).to_string();
        let slot = *by_module.entry(module).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(name);
    }

    debug!(
        "inferred {} phase(s) for model {}",
        groups.len(),
        model.name()
    );

    let phases = groups
        .into_iter()
        .map(|params| Phase {
            patterns: params.clone(),
            params,
            lr: None,
            max_transition_epoch: None,
        })
        .collect();

    Schedule::from_phases(phases)
}
