mod common;

use common::*;
use finetuning_scheduler::{
    Collaborators, EpochDecision, ErrorKind, FinetuningScheduler, FtsConfig, FtsErr, NamedParams,
    Optimizer, Outcome, ParamGroup, ParamGroups, PhaseSpec, ScheduleDocument, Transition, Trigger,
    Warning,
};

fn explicit_schedule() -> ScheduleDocument {
    let mut doc = ScheduleDocument::new();
    doc.insert(
        0,
        PhaseSpec::new(["layer.3.bias", "layer.3.weight"]).with_max_transition_epoch(2),
    );
    doc.insert(
        1,
        PhaseSpec::new(["layer.2.*"])
            .with_lr(1e-6)
            .with_max_transition_epoch(1),
    );
    doc.insert(2, PhaseSpec::new(["layer.1.*", "layer.0.*"]));
    doc
}

#[test]
fn implicit_schedule_thaws_one_module_per_plateau() {
    let mut fts = FinetuningScheduler::new(config());
    let mut h = Harness::new(boring_model(), 1);
    h.seed_optimizer(&mut fts);

    assert_eq!(h.start(&mut fts).unwrap(), Outcome::Proceed);
    h.fit(&mut fts, &INTRAFIT_LOSSES).unwrap();

    assert_eq!(transition_epochs(&h.decisions), vec![4, 5, 6]);
    assert_eq!(h.decisions.len(), 8);
    assert_eq!(h.decisions.last(), Some(&EpochDecision::Stop));

    let start = |depth, depth_remaining, ft_epoch, groups, thawed| EpochStart {
        depth,
        depth_remaining,
        ft_epoch,
        groups,
        thawed,
    };
    assert_eq!(h.starts[0], start(0, 3, 0, 1, 2));
    assert_eq!(h.starts[4], start(0, 3, 4, 1, 2));
    assert_eq!(h.starts[5], start(1, 2, 5, 2, 4));
    assert_eq!(h.starts[6], start(2, 1, 6, 3, 6));
    assert_eq!(h.starts[7], start(3, 0, 7, 4, 8));

    assert_eq!(fts.current_depth(), 3);
    assert_eq!(fts.ft_epoch(), 8);
    assert_eq!(fts.thawed_parameters().len(), 8);
    assert_eq!(fts.ledger().len(), 4);
    assert_eq!(fts.ledger().groups(), h.optimizer.param_groups());
    assert_eq!(h.model.trainable().len(), 8);
    assert_eq!(h.store.restores, 3);

    let depths = fts.checkpoint_depths();
    assert_eq!(depths.best_checkpoint_depth, 0);
    assert_eq!(depths.current_checkpoint_depth, 3);
}

#[test]
fn first_transition_reuses_the_base_group_hyperparameters() {
    let mut fts = FinetuningScheduler::new(config());
    let mut h = Harness::new(boring_model(), 1);
    h.seed_optimizer(&mut fts);
    h.start(&mut fts).unwrap();
    h.fit(&mut fts, &INTRAFIT_LOSSES[..5]).unwrap();

    assert_eq!(
        h.decisions[4],
        EpochDecision::Transitioned(Transition {
            from: 0,
            to: 1,
            trigger: Trigger::Plateau,
            thawed: vec!["layer.2.bias".into(), "layer.2.weight".into()],
            groups_added: 1,
        })
    );

    let group = &h.optimizer.param_groups()[1];
    assert_eq!(group.lr, BASE_LR);
    assert_eq!(group.weight_decay, BASE_WD);
    assert_eq!(h.model.is_trainable("layer.2.weight"), Some(true));
    assert_eq!(h.model.is_trainable("layer.1.weight"), Some(false));
}

#[test]
fn explicit_schedule_follows_ceilings_and_phase_lrs() {
    let config = FtsConfig {
        base_max_lr: Some(1e-5),
        ..config()
    };
    let mut fts = FinetuningScheduler::new(config).with_schedule(explicit_schedule());
    let mut h = Harness::new(boring_model(), 3);
    h.seed_optimizer(&mut fts);
    h.start(&mut fts).unwrap();

    h.fit(&mut fts, &[1.0, 0.9, 0.8, 0.7, 0.6, 0.5]).unwrap();

    assert_eq!(transition_epochs(&h.decisions), vec![2, 4]);
    assert!(h.decisions.iter().all(|d| match d {
        EpochDecision::Transitioned(t) => t.trigger == Trigger::EpochCeiling,
        _ => true,
    }));
    assert_eq!(fts.current_depth(), 2);
    assert_eq!(fts.ft_epoch(), 6);

    let lrs: Vec<f64> = fts.ledger().groups().iter().map(|g| g.lr).collect();
    assert_eq!(lrs, vec![1e-3, 1e-6, 1e-5]);
    assert_eq!(h.model.trainable().len(), 8);
    assert!(fts.warnings().is_empty());
}

#[test]
fn no_decay_params_are_split_into_their_own_groups() {
    let config = FtsConfig {
        no_decay: vec!["bias".into()],
        ..config()
    };
    let mut fts = FinetuningScheduler::new(config);
    let mut h = Harness::new(boring_model(), 1);
    h.seed_optimizer(&mut fts);
    h.start(&mut fts).unwrap();
    h.fit(&mut fts, &INTRAFIT_LOSSES).unwrap();

    let groups = h.optimizer.param_groups();
    assert_eq!(groups.len(), 7);
    assert_eq!(groups[1].params, vec!["layer.2.weight"]);
    assert_eq!(groups[1].weight_decay, BASE_WD);
    assert_eq!(groups[2].params, vec!["layer.2.bias"]);
    assert_eq!(groups[2].weight_decay, 0.0);
    assert_eq!(fts.ledger().groups(), groups);
}

#[test]
fn max_depth_zero_trains_only_the_first_phase() {
    let config = FtsConfig {
        max_depth: 0,
        ..config()
    };
    let mut fts = FinetuningScheduler::new(config);
    let mut h = Harness::new(boring_model(), 1);
    h.seed_optimizer(&mut fts);
    h.start(&mut fts).unwrap();
    h.fit(&mut fts, &INTRAFIT_LOSSES).unwrap();

    assert_eq!(h.decisions.len(), 5);
    assert!(transition_epochs(&h.decisions).is_empty());
    assert_eq!(h.decisions[4], EpochDecision::Stop);
    assert_eq!(fts.depth_remaining(), 0);
    assert_eq!(fts.thawed_parameters().len(), 2);
    assert_eq!(h.store.restores, 0);
}

#[test]
fn max_depth_clamps_the_run() {
    let config = FtsConfig {
        max_depth: 2,
        ..config()
    };
    let mut fts = FinetuningScheduler::new(config);
    let mut h = Harness::new(boring_model(), 1);
    h.seed_optimizer(&mut fts);
    h.start(&mut fts).unwrap();
    h.fit(&mut fts, &INTRAFIT_LOSSES).unwrap();

    assert_eq!(transition_epochs(&h.decisions), vec![4, 5]);
    assert_eq!(h.decisions.len(), 7);
    assert_eq!(fts.max_depth(), 2);
    assert_eq!(fts.ft_epoch(), 7);
    assert_eq!(fts.thawed_parameters().len(), 6);
    assert_eq!(fts.ledger().len(), 3);
    assert_eq!(h.model.is_trainable("layer.0.weight"), Some(false));
}

#[test]
fn two_phase_run_ends_at_the_last_depth() {
    let mut doc = ScheduleDocument::new();
    doc.insert(0, PhaseSpec::new(["b.weight"]));
    doc.insert(1, PhaseSpec::new(["a.weight"]));

    let mut fts = FinetuningScheduler::new(config()).with_schedule(doc);
    let mut h = Harness::new(NamedParams::new("Pair", ["a.weight", "b.weight"]), 1);
    h.seed_optimizer(&mut fts);
    h.start(&mut fts).unwrap();
    h.fit(&mut fts, &[1.0, 0.9, 0.8, 0.9, 1.0, 1.1]).unwrap();

    assert_eq!(transition_epochs(&h.decisions), vec![3]);
    assert_eq!(h.decisions.len(), 5);
    assert_eq!(h.decisions[4], EpochDecision::Stop);
    assert_eq!(fts.current_depth(), 1);
    assert_eq!(fts.depth_remaining(), 0);
}

#[test]
fn epoch_transitions_only_requires_every_ceiling() {
    let mut doc = explicit_schedule();
    doc.insert(0, PhaseSpec::new(["layer.3.*"]));

    let config = FtsConfig {
        epoch_transitions_only: true,
        ..config()
    };
    let mut fts = FinetuningScheduler::new(config).with_schedule(doc);
    let mut h = Harness::new(boring_model(), 1);
    h.seed_optimizer(&mut fts);

    let err = h.start(&mut fts).unwrap_err();
    assert!(matches!(err, FtsErr::MissingTransitionEpoch { depth: 0 }));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!fts.is_started());
    // Nothing was frozen.
    assert_eq!(h.model.trainable().len(), 8);
}

#[test]
fn epoch_transitions_only_ignores_plateaus_and_warns() {
    let mut doc = explicit_schedule();
    doc.insert(
        1,
        PhaseSpec::new(["layer.2.*"]).with_max_transition_epoch(3),
    );

    let config = FtsConfig {
        epoch_transitions_only: true,
        max_epochs: Some(6),
        ..config()
    };
    let mut fts = FinetuningScheduler::new(config).with_schedule(doc);
    let mut h = Harness::new(boring_model(), 1);
    h.seed_optimizer(&mut fts);
    h.start(&mut fts).unwrap();
    h.fit(&mut fts, &INTRAFIT_LOSSES).unwrap();

    assert_eq!(transition_epochs(&h.decisions), vec![2, 6]);
    assert_eq!(h.decisions.len(), INTRAFIT_LOSSES.len());
    assert!(!h.decisions.contains(&EpochDecision::Stop));

    assert!(fts.warnings().contains(&Warning::RedundantEarlyStopping));
    assert!(fts.warnings().contains(&Warning::ScheduleExceedsMaxEpochs {
        scheduled: 7,
        max_epochs: 6,
    }));
}

#[test]
fn plateau_transitions_need_an_early_stopping_collaborator() {
    let config = FtsConfig {
        restore_best: false,
        ..config()
    };
    let mut fts = FinetuningScheduler::new(config);
    let mut h = Harness::new(boring_model(), 1);
    h.seed_optimizer(&mut fts);

    let mut c = Collaborators::new(&mut h.model, &mut h.optimizer);
    let err = fts.on_run_start(&mut c).unwrap_err();
    assert!(matches!(
        err,
        FtsErr::MissingCollaborator {
            name: "early_stopping"
        }
    ));
}

#[test]
fn restore_best_needs_a_checkpoint_store() {
    let mut fts = FinetuningScheduler::new(config());
    let mut h = Harness::new(boring_model(), 1);
    h.seed_optimizer(&mut fts);

    let mut c = Collaborators::new(&mut h.model, &mut h.optimizer)
        .with_early_stopping(&mut h.early_stopping);
    let err = fts.on_run_start(&mut c).unwrap_err();
    assert!(matches!(
        err,
        FtsErr::MissingCollaborator {
            name: "checkpoint_store"
        }
    ));
}

#[test]
fn optimizers_without_a_base_group_are_rejected() {
    let mut fts = FinetuningScheduler::new(config());
    let mut h = Harness::new(boring_model(), 1);
    h.optimizer = ParamGroups::default();

    assert!(matches!(h.start(&mut fts), Err(FtsErr::EmptyOptimizer)));
}

#[test]
fn phase_zero_params_outside_the_optimizer_are_rejected() {
    let mut fts = FinetuningScheduler::new(config());
    let mut h = Harness::new(boring_model(), 1);
    h.optimizer = ParamGroups::new(ParamGroup::new(["layer.3.weight"], BASE_LR, BASE_WD));

    let err = h.start(&mut fts).unwrap_err();
    assert!(matches!(&err, FtsErr::UngroupedPhaseZeroParam { name } if name == "layer.3.bias"));
    assert_eq!(err.kind(), ErrorKind::Configuration);

    // Nothing was thawed or recorded.
    assert!(!fts.is_started());
    assert!(fts.thawed_parameters().is_empty());
    assert!(fts.ledger().is_empty());
    assert_eq!(h.model.trainable().len(), 8);
}

#[test]
fn missing_schedule_files_are_reported() {
    let config = FtsConfig {
        ft_schedule: Some("does/not/exist.yaml".into()),
        ..config()
    };
    let mut fts = FinetuningScheduler::new(config);
    let mut h = Harness::new(boring_model(), 1);

    let err = h.start(&mut fts).unwrap_err();
    assert!(matches!(err, FtsErr::ScheduleNotFound { .. }));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn invalid_configs_are_rejected_at_run_start() {
    let config = FtsConfig {
        max_depth: -3,
        ..config()
    };
    let mut fts = FinetuningScheduler::new(config);
    let mut h = Harness::new(boring_model(), 1);
    h.seed_optimizer(&mut fts);

    assert!(matches!(h.start(&mut fts), Err(FtsErr::InvalidConfig(_))));
}

#[test]
fn gen_only_writes_the_schedule_and_skips_training() {
    let dir = tempfile::tempdir().unwrap();
    let config = FtsConfig {
        gen_ft_sched_only: true,
        log_dir: Some(dir.path().to_path_buf()),
        ..config()
    };
    let mut fts = FinetuningScheduler::new(config);
    let mut h = Harness::new(boring_model(), 1);

    let outcome = h.start(&mut fts).unwrap();
    let expected = dir.path().join("BoringModel_ft_schedule.yaml");
    assert_eq!(
        outcome,
        Outcome::ScheduleWrittenOnly {
            path: expected.clone()
        }
    );
    assert!(!fts.is_started());

    let written = ScheduleDocument::load(&expected).unwrap();
    assert_eq!(written.len(), 4);
    assert_eq!(
        written.get(0).unwrap().params,
        vec!["layer.3.bias", "layer.3.weight"]
    );
    assert_eq!(written.get(3).unwrap().params, vec!["layer.0.bias", "layer.0.weight"]);
}

#[test]
fn implicit_runs_leave_the_generated_schedule_in_log_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = FtsConfig {
        log_dir: Some(dir.path().to_path_buf()),
        ..config()
    };
    let mut fts = FinetuningScheduler::new(config);
    let mut h = Harness::new(boring_model(), 1);
    h.seed_optimizer(&mut fts);

    assert_eq!(h.start(&mut fts).unwrap(), Outcome::Proceed);
    assert!(dir.path().join("BoringModel_ft_schedule.yaml").exists());
}

#[test]
fn unscheduled_params_stay_frozen_with_a_warning() {
    let mut doc = ScheduleDocument::new();
    doc.insert(0, PhaseSpec::new(["layer.3.*"]));
    doc.insert(1, PhaseSpec::new(["layer.2.*"]));

    let mut fts = FinetuningScheduler::new(config()).with_schedule(doc);
    let mut h = Harness::new(boring_model(), 1);
    h.seed_optimizer(&mut fts);
    h.start(&mut fts).unwrap();
    h.fit(&mut fts, &INTRAFIT_LOSSES).unwrap();

    let warned = fts.warnings().iter().find_map(|w| match w {
        Warning::UnscheduledParameters { params } => Some(params.len()),
        _ => None,
    });
    assert_eq!(warned, Some(4));
    assert_eq!(h.model.trainable().len(), 4);
    assert_eq!(h.model.is_trainable("layer.1.bias"), Some(false));
}

#[test]
fn transitions_before_any_best_checkpoint_warn() {
    let mut fts = FinetuningScheduler::new(config());
    let mut h = Harness::new(boring_model(), 1);
    h.seed_optimizer(&mut fts);
    h.start(&mut fts).unwrap();

    fts.on_epoch_start().unwrap();
    fts.on_checkpoint_save(false).unwrap();
    let mut c = Collaborators::new(&mut h.model, &mut h.optimizer)
        .with_checkpoints(&mut h.store)
        .with_early_stopping(&mut h.early_stopping);
    let decision = fts.on_epoch_end(&mut c, true).unwrap();

    assert!(matches!(decision, EpochDecision::Transitioned(_)));
    assert_eq!(h.store.restores, 0);
    assert_eq!(fts.warnings(), &[Warning::NoBestCheckpoint { depth: 1 }]);
}
