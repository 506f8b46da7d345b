mod common;

use std::collections::{BTreeSet, HashSet};

use common::*;
use finetuning_scheduler::{
    infer_schedule,
    model::param_names,
    schedule::{RawSchedule, Validator},
    Collaborators, FinetuningScheduler, FtsConfig, NamedParams, Optimizer, ParamGroup,
    ParamGroups,
};
use proptest::prelude::*;

/// Models of 1..8 blocks, each with a few direct params and maybe a child module.
fn model_strategy() -> impl Strategy<Value = NamedParams> {
    prop::collection::vec((1usize..4, any::<bool>()), 1..8).prop_map(|blocks| {
        let mut names = Vec::new();
        for (i, (direct, child)) in blocks.into_iter().enumerate() {
            names.extend((0..direct).map(|j| format!("net.{i}.p{j}")));
            if child {
                names.push(format!("net.{i}.inner.weight"));
                names.push(format!("net.{i}.inner.bias"));
            }
        }
        NamedParams::new("Generated", names)
    })
}

fn scripted_config(max_depth: i64) -> FtsConfig {
    FtsConfig {
        max_depth,
        restore_best: false,
        ..FtsConfig::default()
    }
}

fn started(model: &mut NamedParams, config: FtsConfig) -> (FinetuningScheduler, ParamGroups) {
    let mut fts = FinetuningScheduler::new(config);
    let phase0 = fts.resolve_schedule(&*model).unwrap().phases()[0].params.clone();
    let mut optimizer = ParamGroups::new(ParamGroup::new(phase0, BASE_LR, BASE_WD));

    let mut monitor = Scripted::default();
    let mut c = Collaborators::new(&mut *model, &mut optimizer).with_early_stopping(&mut monitor);
    fts.on_run_start(&mut c).unwrap();
    (fts, optimizer)
}

proptest! {
    #[test]
    fn inferred_phases_are_disjoint_and_cover_the_model(model in model_strategy()) {
        let schedule = infer_schedule(&model).unwrap();
        let names = param_names(&model);

        let mut seen = HashSet::new();
        for phase in schedule.phases() {
            for param in &phase.params {
                prop_assert!(seen.insert(param.clone()), "{} scheduled twice", param);
            }
        }
        prop_assert_eq!(seen.len(), names.len());
        prop_assert!(schedule.unscheduled(&names).is_empty());
    }

    #[test]
    fn inferred_schedules_pass_validation_unchanged(model in model_strategy()) {
        let schedule = infer_schedule(&model).unwrap();
        let names = param_names(&model);

        let raw = RawSchedule::from_document(&schedule.to_document()).unwrap();
        let validated = Validator::new(&names).validate(&raw).unwrap();
        prop_assert_eq!(validated, schedule);
    }

    #[test]
    fn thawing_is_monotonic_and_depth_is_clamped(
        mut model in model_strategy(),
        max_depth in -1i64..6,
        plateaus in prop::collection::vec(any::<bool>(), 1..25),
    ) {
        let (mut fts, mut optimizer) = started(&mut model, scripted_config(max_depth));
        let schedule_max = fts.schedule().unwrap().max_depth();
        let bound = if max_depth < 0 { schedule_max } else { schedule_max.min(max_depth as usize) };

        let mut snapshots: Vec<(usize, BTreeSet<String>, usize)> = Vec::new();
        scripted_run(&mut fts, &mut model, &mut optimizer, &plateaus, |fts, model| {
            snapshots.push((
                fts.current_depth(),
                fts.thawed_parameters().clone(),
                model.trainable().len(),
            ));
        })
        .unwrap();

        let mut previous: BTreeSet<String> = BTreeSet::new();
        for (depth, thawed, trainable) in snapshots {
            prop_assert!(depth <= bound);
            prop_assert!(thawed.is_superset(&previous));
            prop_assert_eq!(thawed.len(), trainable);
            previous = thawed;
        }
        prop_assert_eq!(fts.ledger().groups(), optimizer.param_groups());
    }

    #[test]
    fn resuming_reproduces_the_ledger(
        model in model_strategy(),
        plateaus in prop::collection::vec(any::<bool>(), 1..20),
        cut in 0usize..20,
    ) {
        let cut = cut.min(plateaus.len());

        let mut original_model = model.clone();
        let (mut original, mut original_opt) = started(&mut original_model, scripted_config(-1));
        scripted_run(&mut original, &mut original_model, &mut original_opt, &plateaus[..cut], |_, _| {})
            .unwrap();
        let payload = original.state().unwrap().to_bytes().unwrap();
        let ledger_at_cut = original.ledger().clone();

        let mut resumed_model = model;
        let (mut resumed, mut resumed_opt) = started(&mut resumed_model, scripted_config(-1));
        {
            let mut monitor = Scripted::default();
            let mut c = Collaborators::new(&mut resumed_model, &mut resumed_opt)
                .with_early_stopping(&mut monitor);
            resumed.on_checkpoint_load(&mut c, &payload).unwrap();
        }

        prop_assert_eq!(resumed.ledger(), &ledger_at_cut);
        prop_assert_eq!(resumed_opt.param_groups(), ledger_at_cut.groups());
        prop_assert_eq!(resumed_model.trainable(), original_model.trainable());
        prop_assert_eq!(resumed.current_depth(), original.current_depth());
    }
}
