//! End-to-end training scenarios for the maximum-entropy classifier.
//!
//! Coverage
//! --------
//! - Training on small separable corpora, with and without regularization.
//! - Feature cutoffs, held-out splitting and early stopping.
//! - Inequality (box) training and its sparsity.
//! - Model persistence through a temporary file.
use blmvm_maxent::{MaxentError, MeModel, MeSample, Termination, TrainOptions};
use spectral::prelude::*;

fn two_class_corpus() -> Vec<MeSample> {
    vec![
        MeSample::new("A").with_feature("f1"),
        MeSample::new("B").with_feature("f2"),
        MeSample::new("A").with_feature("f1").with_feature("f3"),
        MeSample::new("B").with_feature("f2").with_feature("f3"),
    ]
}

fn probe(features: &[&str]) -> MeSample {
    let mut s = MeSample::default();
    for f in features {
        s.add_feature(*f);
    }
    s
}

#[test]
fn separable_corpus_learns_the_indicative_feature() {
    let mut model = MeModel::new();
    let report = model
        .train_on(&two_class_corpus(), &TrainOptions::default())
        .unwrap();
    assert_that!(&report.features).is_equal_to(4);
    assert_that!(&report.train_error).is_equal_to(0.0);

    let a = model.classify(&probe(&["f1"])).unwrap();
    assert_eq!(a.label, "A");
    assert_that!(&a.probabilities[model.class_id("A").unwrap()]).is_greater_than(0.5);

    let b = model.classify(&probe(&["f2", "f3"])).unwrap();
    assert_eq!(b.label, "B");

    let sum: f64 = a.probabilities.iter().sum();
    assert_that!(&sum).is_close_to(1.0, 1e-12);
}

#[test]
fn unknown_features_are_ignored_at_classification() {
    let mut model = MeModel::new();
    model
        .train_on(&two_class_corpus(), &TrainOptions::default().with_sigma(1.0))
        .unwrap();
    let plain = model.classify(&probe(&["f1"])).unwrap();
    let noisy = model.classify(&probe(&["f1", "never-seen"])).unwrap();
    assert_eq!(plain, noisy);
}

#[test]
fn cutoff_drops_rare_pairs() {
    let corpus = vec![
        MeSample::new("A").with_feature("f1").with_feature("f9"),
        MeSample::new("B").with_feature("f2"),
        MeSample::new("A").with_feature("f1"),
        MeSample::new("B").with_feature("f2"),
    ];
    let mut model = MeModel::new();
    let report = model
        .train_on(&corpus, &TrainOptions::default().with_cutoff(2).with_sigma(1.0))
        .unwrap();
    assert_that!(&report.features).is_equal_to(2);
    assert!(model.features().iter().all(|(_, feature, _)| *feature != "f9"));
    assert!(model.features().iter().any(|(_, feature, _)| *feature == "f1"));
}

#[test]
fn early_stopping_keeps_weights_from_before_the_decline() {
    // The held-out samples pair f1 with B, so any step towards the training
    // optimum lowers their likelihood.
    let mut corpus = two_class_corpus();
    corpus[2] = MeSample::new("A").with_feature("f1");
    corpus[3] = MeSample::new("B").with_feature("f2");
    corpus.push(MeSample::new("B").with_feature("f1"));
    corpus.push(MeSample::new("B").with_feature("f1"));

    let mut model = MeModel::new();
    let report = model
        .train_on(&corpus, &TrainOptions::default().with_heldout(2, 1))
        .unwrap();
    assert_eq!(report.termination, Termination::EarlyStopped);
    assert_that!(&report.iterations).is_equal_to(1);
    assert_that!(&report.heldout_samples).is_equal_to(2);
    assert_that!(&report.training_samples).is_equal_to(4);
    assert_that!(&report.heldout_error.unwrap()).is_equal_to(1.0);
    assert_that!(&report.heldout_log_likelihood.unwrap()).is_close_to(0.5f64.ln(), 1e-12);

    let weights = model.features();
    assert_that!(&weights.len()).is_equal_to(2);
    assert!(weights.iter().all(|(_, _, w)| *w == 0.0));
}

#[test]
fn without_window_heldout_data_only_shrinks_training() {
    let mut corpus = two_class_corpus();
    corpus.push(MeSample::new("B").with_feature("f1"));
    let mut model = MeModel::new();
    let report = model
        .train_on(&corpus, &TrainOptions::default().with_heldout(1, 0).with_sigma(1.0))
        .unwrap();
    assert_eq!(report.termination, Termination::Converged);
    assert_that!(&report.training_samples).is_equal_to(4);
    assert_that!(&report.heldout_samples).is_equal_to(1);
    assert_that!(&report.heldout_error.unwrap()).is_equal_to(1.0);
}

#[test]
fn heldout_samples_with_unseen_labels_are_dropped() {
    let mut corpus = two_class_corpus();
    corpus.push(MeSample::new("C").with_feature("f3"));
    let mut model = MeModel::new();
    let report = model
        .train_on(&corpus, &TrainOptions::default().with_heldout(1, 1).with_sigma(1.0))
        .unwrap();
    assert_that!(&report.heldout_samples).is_equal_to(0);
    assert!(report.heldout_error.is_none());
    assert_eq!(report.termination, Termination::Converged);
    assert_that!(&model.num_classes()).is_equal_to(2);
}

#[test]
fn too_much_heldout_data_aborts_training() {
    let mut model = MeModel::new();
    let err = model
        .train_on(&two_class_corpus(), &TrainOptions::default().with_heldout(4, 1))
        .unwrap_err();
    assert!(matches!(
        err,
        MaxentError::InsufficientTrainingData {
            samples: 4,
            heldout: 4
        }
    ));
    assert_that!(&model.num_features()).is_equal_to(0);
    // the queue survives a rejected configuration
    assert_that!(&model.pending_samples()).is_equal_to(4);
}

#[test]
fn wide_inequality_keeps_every_weight_at_zero() {
    let mut model = MeModel::new();
    let report = model
        .train_on(&two_class_corpus(), &TrainOptions::default().with_widthfactor(100.0))
        .unwrap();
    assert_eq!(report.termination, Termination::Converged);
    assert_that!(&report.iterations).is_equal_to(0);
    assert_that!(&report.active_features).is_equal_to(0);
    assert!(model.features().iter().all(|(_, _, w)| *w == 0.0));
}

#[test]
fn narrow_inequality_learns_a_sparse_model() {
    let mut model = MeModel::new();
    let options = TrainOptions::from_json(r#"{ "widthfactor": 0.1, "sigma": 5.0 }"#).unwrap();
    let report = model.train_on(&two_class_corpus(), &options).unwrap();
    assert_that!(&report.active_features).is_greater_than(0);
    assert_that!(&report.active_features).is_less_than_or_equal_to(report.features);
    for (_, _, w) in model.features() {
        assert_that!(&w.abs()).is_less_than_or_equal_to(10_000.0);
    }
    assert_eq!(model.classify(&probe(&["f1"])).unwrap().label, "A");
}

#[test]
fn real_valued_features_shift_the_decision() {
    let corpus = vec![
        MeSample::new("hot").with_real_feature("temp", 2.0),
        MeSample::new("cold").with_real_feature("temp", -2.0),
        MeSample::new("hot").with_real_feature("temp", 1.5),
        MeSample::new("cold").with_real_feature("temp", -1.0),
    ];
    let mut model = MeModel::new();
    model
        .train_on(&corpus, &TrainOptions::default().with_sigma(2.0))
        .unwrap();
    let warm = MeSample::default().with_real_feature("temp", 1.0);
    let chilly = MeSample::default().with_real_feature("temp", -1.0);
    assert_eq!(model.classify(&warm).unwrap().label, "hot");
    assert_eq!(model.classify(&chilly).unwrap().label, "cold");
}

#[test]
fn saved_model_reproduces_probabilities() {
    let mut corpus = two_class_corpus();
    corpus.push(
        MeSample::new("C")
            .with_feature("f3")
            .with_real_feature("len", 0.3),
    );
    corpus.push(MeSample::new("A").with_real_feature("len", 1.2));

    let mut model = MeModel::new();
    model
        .train_on(&corpus, &TrainOptions::default().with_sigma(1.0))
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("maxent.model");
    model.save_to_file(&path).unwrap();

    let mut loaded = MeModel::new();
    loaded.load_from_file(&path).unwrap();
    assert_that!(&loaded.num_classes()).is_equal_to(model.num_classes());

    let probes = [
        probe(&["f1"]),
        probe(&["f2", "f3"]),
        probe(&["f3"]).with_real_feature("len", 0.5),
        MeSample::default().with_real_feature("len", -2.0),
    ];
    for p in &probes {
        let before = model.classify(p).unwrap();
        let after = loaded.classify(p).unwrap();
        assert_eq!(before.label, after.label);
        for (x, y) in before.probabilities.iter().zip(&after.probabilities) {
            assert_that!(*x).is_close_to(*y, 1e-6);
        }
    }
}

#[test]
fn saved_all_zero_model_keeps_its_classes() {
    let mut model = MeModel::new();
    model
        .train_on(&two_class_corpus(), &TrainOptions::default().with_widthfactor(100.0))
        .unwrap();
    let before = model.classify(&probe(&["f1"])).unwrap();
    assert_eq!(before.probabilities, vec![0.5, 0.5]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sparse.model");
    model.save_to_file(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text, "A\tf1\t0\nB\tf2\t0\n");

    let mut loaded = MeModel::new();
    loaded.load_from_file(&path).unwrap();
    assert_that!(&loaded.num_classes()).is_equal_to(2);
    assert_eq!(loaded.classify(&probe(&["f1"])).unwrap(), before);
}

#[test]
fn saved_model_keeps_a_class_whose_features_were_cut() {
    let mut corpus = two_class_corpus();
    corpus.push(MeSample::new("C").with_feature("f4"));
    let mut model = MeModel::new();
    let report = model
        .train_on(&corpus, &TrainOptions::default().with_cutoff(2).with_sigma(1.0))
        .unwrap();
    assert_that!(&report.classes).is_equal_to(3);
    assert_that!(&report.features).is_equal_to(2);
    assert!(model.weight("C", "f4").is_none());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cut.model");
    model.save_to_file(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.ends_with("C\t\t0\n"));

    let mut loaded = MeModel::new();
    loaded.load_from_file(&path).unwrap();
    assert_that!(&loaded.num_classes()).is_equal_to(3);
    assert_eq!(loaded.class_id("C"), Some(2));
    for p in [probe(&["f1"]), probe(&["f2", "f3"]), probe(&["f4"])] {
        let before = model.classify(&p).unwrap();
        let after = loaded.classify(&p).unwrap();
        assert_eq!(before.class_id, after.class_id);
        assert_eq!(before.label, after.label);
        assert_that!(&after.probabilities.len()).is_equal_to(3);
        for (x, y) in before.probabilities.iter().zip(&after.probabilities) {
            assert_that!(*x).is_close_to(*y, 1e-6);
        }
    }
}

#[test]
fn retraining_a_loaded_model_forgets_its_old_classes() {
    let mut model = MeModel::new();
    model
        .load_from_entries([("X", "f1", 0.5), ("Y", "g", -0.5)])
        .unwrap();
    assert_that!(&model.num_classes()).is_equal_to(2);

    let report = model
        .train_on(&two_class_corpus(), &TrainOptions::default().with_sigma(1.0))
        .unwrap();
    assert_that!(&report.classes).is_equal_to(2);
    assert_that!(&model.num_classes()).is_equal_to(2);
    assert_eq!(model.class_label(0), Some("A"));
    assert_eq!(model.class_label(1), Some("B"));
    assert!(model.class_id("X").is_none());
    assert!(model.weight("X", "f1").is_none());

    let a = model.classify(&probe(&["f1"])).unwrap();
    assert_eq!(a.label, "A");
    assert_that!(&a.probabilities.len()).is_equal_to(2);
    assert_that!(&a.probabilities[0]).is_greater_than(0.5);
}

#[test]
fn samples_queued_after_a_load_define_the_classes() {
    let mut model = MeModel::new();
    model
        .load_from_entries([("X", "f1", 0.5), ("Y", "g", -0.5)])
        .unwrap();
    for sample in [
        MeSample::new("Z").with_feature("f1"),
        MeSample::new("Y").with_feature("f2"),
    ] {
        model.add_training_sample(&sample).unwrap();
    }
    let report = model
        .train(&TrainOptions::default().with_sigma(1.0))
        .unwrap();
    assert_that!(&report.classes).is_equal_to(2);
    // label table order, not queue order
    assert_eq!(model.class_label(0), Some("Y"));
    assert_eq!(model.class_label(1), Some("Z"));
    assert_eq!(model.classify(&probe(&["f1"])).unwrap().label, "Z");
    assert_eq!(model.classify(&probe(&["f2"])).unwrap().label, "Y");
}

#[test]
fn training_options_from_key_value_pairs() {
    let mut options = TrainOptions::default();
    options.set("sigma", "1.0").unwrap();
    options.set("cutoff", "1").unwrap();
    let mut model = MeModel::new();
    for sample in two_class_corpus() {
        model.add_training_sample(&sample).unwrap();
    }
    let report = model.train(&options).unwrap();
    assert_eq!(report.termination, Termination::Converged);
    assert_that!(&report.func_evals).is_greater_than(report.iterations);
}
