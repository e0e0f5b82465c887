//! Maximum-entropy (multinomial logistic regression) classifier trained with
//! [`Blmvm`].
//!
//! Training builds a sparse index of `(label, feature)` pairs from the queued
//! samples, precomputes the empirical feature expectations, and hands a
//! [`TrainingSession`] to the solver as its [`Objective`]. The session
//! evaluates the regularized negative mean log-likelihood and its gradient,
//! `-(empirical - model [- regularization])`.
//!
//! Two regularizers are available, mutually exclusive:
//! - a Gaussian prior with scale `sigma`, adding `λ²/(2σ²)` per weight;
//! - inequality training, which splits each weight into `α - β` with
//!   `α, β ≥ 0` and adds the linear penalty `width·(α + β)`.

use std::collections::HashMap;
use std::path::PathBuf;

use ndarray::{Array1, Zip, s};

use crate::features::{FeatureBag, FeatureKey, MAX_FEATURE_INDEX, MAX_LABELS, StringBag};
use crate::options::TrainOptions;
use crate::vector::{self, VectorError};
use crate::{Blmvm, BlmvmError, Objective, Termination};

/// Scores above this are shifted down before exponentiation.
const SCORE_OVERFLOW_LIMIT: f64 = 700.0;

#[derive(Debug, thiserror::Error)]
pub enum MaxentError {
    #[error("too many distinct labels (at most {limit} are supported)")]
    TooManyLabels { limit: usize },
    #[error("feature index {index} does not fit in 24 bits")]
    FeatureIndexOverflow { index: usize },
    #[error("no training samples")]
    EmptyCorpus,
    #[error("the model has no classes; train or load it first")]
    EmptyModel,
    #[error("too much held-out data: {heldout} of {samples} samples, none left for training")]
    InsufficientTrainingData { samples: usize, heldout: usize },
    #[error("unknown option '{key}'")]
    UnknownOption { key: String },
    #[error("invalid value '{value}' for option '{key}': {reason}")]
    InvalidOption {
        key: String,
        value: String,
        reason: &'static str,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] serde_json::Error),
    #[error(transparent)]
    Solver(#[from] BlmvmError),
    #[error(transparent)]
    Vector(#[from] VectorError),
    #[error("cannot access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}:{line}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// A training or test sample in string form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeSample {
    pub label: String,
    /// Binary (presence) features.
    pub features: Vec<String>,
    /// Real-valued features.
    pub rvfeatures: Vec<(String, f64)>,
}

impl MeSample {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>) -> Self {
        self.features.push(name.into());
        self
    }

    pub fn with_real_feature(mut self, name: impl Into<String>, value: f64) -> Self {
        self.rvfeatures.push((name.into(), value));
        self
    }

    pub fn add_feature(&mut self, name: impl Into<String>) {
        self.features.push(name.into());
    }

    pub fn add_real_feature(&mut self, name: impl Into<String>, value: f64) {
        self.rvfeatures.push((name.into(), value));
    }
}

// A sample with interned label and feature names.
#[derive(Debug, Clone)]
struct Sample {
    label: usize,
    features: Vec<usize>,
    rvfeatures: Vec<(usize, f64)>,
}

// Feature ids a sample touches, expanded across every class.
#[derive(Debug, Clone, Default)]
struct SampleFeatures {
    binary: Vec<usize>,
    real: Vec<(usize, f64)>,
}

impl SampleFeatures {
    fn build(sample: &Sample, num_classes: usize, bag: &FeatureBag) -> Result<Self, MaxentError> {
        let mut cache = Self::default();
        for &f in &sample.features {
            for label in 0..num_classes {
                if let Some(id) = bag.id(FeatureKey::new(label, f)?) {
                    cache.binary.push(id);
                }
            }
        }
        for &(f, value) in &sample.rvfeatures {
            for label in 0..num_classes {
                if let Some(id) = bag.id(FeatureKey::new(label, f)?) {
                    cache.real.push((id, value));
                }
            }
        }
        Ok(cache)
    }

    fn scores(&self, weights: &Array1<f64>, id_labels: &[usize], scores: &mut [f64]) {
        scores.fill(0.0);
        for &id in &self.binary {
            scores[id_labels[id]] += weights[id];
        }
        for &(id, value) in &self.real {
            scores[id_labels[id]] += weights[id] * value;
        }
    }
}

/// Turns class scores into probabilities in place and returns the arg-max
/// (lowest index on ties).
///
/// Scores are shifted by `max(0, max_score - 700)` before exponentiation.
pub fn conditional_probability(scores: &mut [f64]) -> usize {
    let max_score = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let offset = (max_score - SCORE_OVERFLOW_LIMIT).max(0.0);
    let mut sum = 0.0;
    for p in scores.iter_mut() {
        *p = (*p - offset).exp();
        sum += *p;
    }
    let mut best = 0;
    for i in 0..scores.len() {
        scores[i] /= sum;
        if scores[i] > scores[best] {
            best = i;
        }
    }
    best
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Regularizer {
    None,
    Gaussian { sigma: f64 },
    Inequality { width: f64 },
}

/// The maximum-entropy objective over one training corpus.
///
/// Built once per training run; the corpus caches are read-only while the
/// solver runs.
pub struct TrainingSession {
    regularizer: Regularizer,
    weight_bound: f64,
    num_classes: usize,
    // label of each feature id
    id_labels: Vec<usize>,
    train: Vec<SampleFeatures>,
    train_labels: Vec<usize>,
    heldout: Vec<SampleFeatures>,
    heldout_labels: Vec<usize>,
    empirical: Array1<f64>,
    model: Array1<f64>,
    lambda: Array1<f64>,
    scores: Vec<f64>,
    log_likelihood: f64,
    train_error: f64,
    heldout_error: Option<f64>,
}

impl TrainingSession {
    fn new(
        regularizer: Regularizer,
        weight_bound: f64,
        num_classes: usize,
        bag: &FeatureBag,
        train: Vec<SampleFeatures>,
        train_labels: Vec<usize>,
        heldout: Vec<SampleFeatures>,
        heldout_labels: Vec<usize>,
    ) -> Self {
        let nf = bag.len();
        let id_labels: Vec<usize> = bag.keys().iter().map(|k| k.label()).collect();

        let mut empirical = Array1::<f64>::zeros(nf);
        for (cache, &label) in train.iter().zip(&train_labels) {
            for &id in &cache.binary {
                if id_labels[id] == label {
                    empirical[id] += 1.0;
                }
            }
            for &(id, value) in &cache.real {
                if id_labels[id] == label {
                    empirical[id] += value;
                }
            }
        }
        if !train.is_empty() {
            vector::scale(1.0 / train.len() as f64, &mut empirical);
        }

        Self {
            regularizer,
            weight_bound,
            num_classes,
            id_labels,
            train,
            train_labels,
            heldout,
            heldout_labels,
            empirical,
            model: Array1::zeros(nf),
            lambda: Array1::zeros(nf),
            scores: vec![0.0; num_classes],
            log_likelihood: 0.0,
            train_error: 1.0,
            heldout_error: None,
        }
    }

    /// Number of solver variables: one per feature, or two under inequality training.
    pub(crate) fn dimension(&self) -> usize {
        match self.regularizer {
            Regularizer::Inequality { .. } => 2 * self.lambda.len(),
            _ => self.lambda.len(),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Mean training log-likelihood at the last evaluation, without regularization.
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn train_error(&self) -> f64 {
        self.train_error
    }

    /// Held-out error rate at the last held-out evaluation.
    pub fn heldout_error(&self) -> Option<f64> {
        self.heldout_error
    }

    fn load_weights(&mut self, x: &Array1<f64>) -> Result<(), VectorError> {
        let nf = self.lambda.len();
        match self.regularizer {
            Regularizer::Inequality { .. } => {
                if x.len() != 2 * nf {
                    return Err(VectorError::LengthMismatch {
                        expected: 2 * nf,
                        found: x.len(),
                    });
                }
                Zip::from(&mut self.lambda)
                    .and(x.slice(s![..nf]))
                    .and(x.slice(s![nf..]))
                    .for_each(|l, &a, &b| *l = a - b);
                Ok(())
            }
            _ => vector::copy(x, &mut self.lambda),
        }
    }

    // Mean log-likelihood of the training corpus under `lambda`; fills the
    // model expectation and the training error rate.
    fn update_model_expectation(&mut self) -> f64 {
        let n = self.train.len();
        vector::set(0.0, &mut self.model);
        let mut logl = 0.0;
        let mut correct = 0usize;
        for (cache, &label) in self.train.iter().zip(&self.train_labels) {
            cache.scores(&self.lambda, &self.id_labels, &mut self.scores);
            let predicted = conditional_probability(&mut self.scores);
            logl += self.scores[label].ln();
            if predicted == label {
                correct += 1;
            }
            for &id in &cache.binary {
                self.model[id] += self.scores[self.id_labels[id]];
            }
            for &(id, value) in &cache.real {
                self.model[id] += self.scores[self.id_labels[id]] * value;
            }
        }
        if n > 0 {
            vector::scale(1.0 / n as f64, &mut self.model);
            self.train_error = 1.0 - correct as f64 / n as f64;
            logl /= n as f64;
        }
        self.log_likelihood = logl;
        logl
    }
}

impl Objective for TrainingSession {
    type Error = MaxentError;

    fn evaluate(&mut self, x: &Array1<f64>) -> Result<(f64, Array1<f64>), MaxentError> {
        self.load_weights(x)?;
        let logl = self.update_model_expectation();
        let nf = self.lambda.len();
        let mut g = Array1::<f64>::zeros(x.len());

        let f = match self.regularizer {
            Regularizer::Inequality { width } => {
                Zip::from(g.slice_mut(s![..nf]))
                    .and(&self.empirical)
                    .and(&self.model)
                    .for_each(|gi, &ee, &me| *gi = -(ee - me - width));
                Zip::from(g.slice_mut(s![nf..]))
                    .and(&self.empirical)
                    .and(&self.model)
                    .for_each(|gi, &ee, &me| *gi = -(me - ee - width));
                // sum(alpha + beta) over both halves of x
                -(logl - width * x.sum())
            }
            Regularizer::Gaussian { sigma } => {
                let c = 1.0 / (sigma * sigma);
                Zip::from(&mut g)
                    .and(&self.empirical)
                    .and(&self.model)
                    .and(&self.lambda)
                    .for_each(|gi, &ee, &me, &l| *gi = -(ee - me - c * l));
                -(logl - 0.5 * c * vector::dot(&self.lambda, &self.lambda)?)
            }
            Regularizer::None => {
                Zip::from(&mut g)
                    .and(&self.empirical)
                    .and(&self.model)
                    .for_each(|gi, &ee, &me| *gi = -(ee - me));
                -logl
            }
        };
        log::debug!(
            "[MaxEnt] logl={:.7} train_err={:.5}",
            self.log_likelihood,
            self.train_error
        );
        Ok((f, g))
    }

    fn bounds(&self, n: usize) -> Result<(Array1<f64>, Array1<f64>), MaxentError> {
        let lower = match self.regularizer {
            Regularizer::Inequality { .. } => 0.0,
            _ => -self.weight_bound,
        };
        Ok((
            Array1::from_elem(n, lower),
            Array1::from_elem(n, self.weight_bound),
        ))
    }

    fn heldout_log_likelihood(&mut self, x: &Array1<f64>) -> Result<Option<f64>, MaxentError> {
        if self.heldout.is_empty() {
            return Ok(None);
        }
        self.load_weights(x)?;
        let mut logl = 0.0;
        let mut correct = 0usize;
        for (cache, &label) in self.heldout.iter().zip(&self.heldout_labels) {
            cache.scores(&self.lambda, &self.id_labels, &mut self.scores);
            let predicted = conditional_probability(&mut self.scores);
            logl += self.scores[label].ln();
            if predicted == label {
                correct += 1;
            }
        }
        let n = self.heldout.len() as f64;
        let error = 1.0 - correct as f64 / n;
        self.heldout_error = Some(error);
        logl /= n;
        log::debug!("[MaxEnt] heldout_logl={:.7} heldout_err={:.4}", logl, error);
        Ok(Some(logl))
    }
}

/// Outcome of [`MeModel::train`].
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub training_samples: usize,
    pub heldout_samples: usize,
    pub classes: usize,
    pub features: usize,
    pub iterations: usize,
    pub func_evals: usize,
    pub projected_gradient_iterations: usize,
    pub rejected_pairs: usize,
    pub exhausted_line_searches: usize,
    pub termination: Termination,
    /// Final regularized objective.
    pub objective: f64,
    /// Mean training log-likelihood at the final weights.
    pub log_likelihood: f64,
    pub train_error: f64,
    pub heldout_log_likelihood: Option<f64>,
    pub heldout_error: Option<f64>,
    /// Features whose final weight is non-zero.
    pub active_features: usize,
}

/// Probabilities over classes and the most likely label.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub class_id: usize,
    /// Indexed by class id.
    pub probabilities: Vec<f64>,
}

/// A maximum-entropy model: label and feature-name tables plus one weight
/// per trained `(label, feature)` pair.
#[derive(Debug, Clone, Default)]
pub struct MeModel {
    samples: Vec<Sample>,
    pub(crate) label_bag: StringBag,
    pub(crate) featurename_bag: StringBag,
    pub(crate) feature_bag: FeatureBag,
    pub(crate) weights: Array1<f64>,
    pub(crate) num_classes: usize,
}

impl MeModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a sample for the next [`train`](MeModel::train) call, interning
    /// its label and feature names.
    pub fn add_training_sample(&mut self, sample: &MeSample) -> Result<(), MaxentError> {
        let label = self.intern_label(&sample.label)?;
        let mut features = Vec::with_capacity(sample.features.len());
        for name in &sample.features {
            features.push(self.intern_feature(name)?);
        }
        let mut rvfeatures = Vec::with_capacity(sample.rvfeatures.len());
        for (name, value) in &sample.rvfeatures {
            rvfeatures.push((self.intern_feature(name)?, *value));
        }
        self.samples.push(Sample {
            label,
            features,
            rvfeatures,
        });
        Ok(())
    }

    pub(crate) fn intern_label(&mut self, name: &str) -> Result<usize, MaxentError> {
        if self.label_bag.id(name).is_none() && self.label_bag.len() >= MAX_LABELS {
            log::error!("[MaxEnt] too many types of labels");
            return Err(MaxentError::TooManyLabels { limit: MAX_LABELS });
        }
        Ok(self.label_bag.put(name))
    }

    pub(crate) fn intern_feature(&mut self, name: &str) -> Result<usize, MaxentError> {
        if self.featurename_bag.id(name).is_none() && self.featurename_bag.len() > MAX_FEATURE_INDEX {
            return Err(MaxentError::FeatureIndexOverflow {
                index: self.featurename_bag.len(),
            });
        }
        Ok(self.featurename_bag.put(name))
    }

    /// Number of queued training samples.
    pub fn pending_samples(&self) -> usize {
        self.samples.len()
    }

    /// Replaces the queued samples with `samples` and trains on them.
    pub fn train_on(&mut self, samples: &[MeSample], options: &TrainOptions) -> Result<TrainingReport, MaxentError> {
        self.samples.clear();
        for sample in samples {
            self.add_training_sample(sample)?;
        }
        self.train(options)
    }

    /// Trains on the queued samples, which are consumed.
    ///
    /// The trailing `heldout_count` samples are held out for early stopping.
    /// The classes of the new model are exactly the labels of the training
    /// portion. On failure the previously trained model is left untouched.
    pub fn train(&mut self, options: &TrainOptions) -> Result<TrainingReport, MaxentError> {
        options.validate()?;
        if self.samples.is_empty() {
            return Err(MaxentError::EmptyCorpus);
        }
        if options.sigma > 0.0 && options.widthfactor > 0.0 {
            log::warn!(
                "[MaxEnt] Gaussian prior and inequality training cannot be combined; using inequality training."
            );
        }
        if options.heldout_count >= self.samples.len() {
            log::error!("[MaxEnt] too much held-out data; no training data is available");
            return Err(MaxentError::InsufficientTrainingData {
                samples: self.samples.len(),
                heldout: options.heldout_count,
            });
        }

        let mut train_samples = std::mem::take(&mut self.samples);
        let heldout_samples = train_samples.split_off(train_samples.len() - options.heldout_count);
        let n_train = train_samples.len();

        let regularizer = if options.widthfactor > 0.0 {
            Regularizer::Inequality {
                width: options.widthfactor / n_train as f64,
            }
        } else if options.sigma > 0.0 {
            Regularizer::Gaussian { sigma: options.sigma }
        } else {
            Regularizer::None
        };
        if options.cutoff > 0 {
            log::info!("[MaxEnt] cutoff threshold = {}", options.cutoff);
        }
        log::info!("[MaxEnt] regularization: {:?}", regularizer);

        // Classes are the labels occurring in the training portion, in label
        // table order. Labels only known from earlier loads or runs drop out.
        let mut class_labels: Vec<usize> = train_samples.iter().map(|s| s.label).collect();
        class_labels.sort_unstable();
        class_labels.dedup();
        let class_of: HashMap<usize, usize> = class_labels
            .iter()
            .enumerate()
            .map(|(class, &label)| (label, class))
            .collect();
        let num_classes = class_labels.len();
        let mut label_bag = StringBag::new();
        for &label in &class_labels {
            label_bag.put(self.label_bag.str(label).unwrap_or_default());
        }
        for sample in &mut train_samples {
            sample.label = class_of[&sample.label];
        }
        let bag = build_feature_bag(&train_samples, options.cutoff)?;

        let mut train = Vec::with_capacity(n_train);
        let mut train_labels = Vec::with_capacity(n_train);
        for sample in &train_samples {
            train.push(SampleFeatures::build(sample, num_classes, &bag)?);
            train_labels.push(sample.label);
        }
        let mut heldout = Vec::with_capacity(heldout_samples.len());
        let mut heldout_labels = Vec::with_capacity(heldout_samples.len());
        for sample in &heldout_samples {
            let Some(&class) = class_of.get(&sample.label) else {
                log::warn!(
                    "[MaxEnt] dropping held-out sample with label '{}' unseen in training",
                    self.label_bag.str(sample.label).unwrap_or("?")
                );
                continue;
            };
            heldout.push(SampleFeatures::build(sample, num_classes, &bag)?);
            heldout_labels.push(class);
        }
        log::info!(
            "[MaxEnt] number of samples = {}, held-out = {}, features = {}, classes = {}",
            n_train,
            heldout.len(),
            bag.len(),
            num_classes
        );

        let session = TrainingSession::new(
            regularizer,
            options.weight_bound,
            num_classes,
            &bag,
            train,
            train_labels,
            heldout,
            heldout_labels,
        );
        let heldout_count = session.heldout.len();
        let window = if heldout_count > 0 {
            options.early_stopping_window
        } else {
            0
        };

        let x0 = Array1::zeros(session.dimension());
        let mut solver = Blmvm::new(x0, session)
            .with_memory(options.memory)
            .with_gradient_tolerance(options.gradient_tolerance)
            .with_max_iterations(options.max_iterations)
            .with_max_evaluations(options.max_evaluations)
            .with_early_stopping(window);
        let solution = solver.run()?;
        let mut session = solver.into_objective();

        // refresh statistics at the returned point
        session.evaluate(&solution.final_point)?;
        let heldout_log_likelihood = session.heldout_log_likelihood(&solution.final_point)?;
        let weights = session.lambda.clone();
        let active_features = weights.iter().filter(|w| **w != 0.0).count();
        if matches!(regularizer, Regularizer::Inequality { .. }) {
            log::info!("[MaxEnt] number of active features = {}", active_features);
        }

        let report = TrainingReport {
            training_samples: n_train,
            heldout_samples: heldout_count,
            classes: num_classes,
            features: bag.len(),
            iterations: solution.iterations,
            func_evals: solution.func_evals,
            projected_gradient_iterations: solution.projected_gradient_iterations,
            rejected_pairs: solution.rejected_pairs,
            exhausted_line_searches: solution.exhausted_line_searches,
            termination: solution.termination,
            objective: solution.final_value,
            log_likelihood: session.log_likelihood(),
            train_error: session.train_error(),
            heldout_log_likelihood,
            heldout_error: session.heldout_error(),
            active_features,
        };

        self.label_bag = label_bag;
        self.feature_bag = bag;
        self.weights = weights;
        self.num_classes = num_classes;
        Ok(report)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn class_label(&self, class_id: usize) -> Option<&str> {
        self.label_bag.str(class_id)
    }

    pub fn class_id(&self, label: &str) -> Option<usize> {
        self.label_bag.id(label)
    }

    /// Number of trained `(label, feature)` weights.
    pub fn num_features(&self) -> usize {
        self.feature_bag.len()
    }

    /// Weight of one `(label, feature)` pair, if it was trained.
    pub fn weight(&self, label: &str, feature: &str) -> Option<f64> {
        let key = FeatureKey::new(self.label_bag.id(label)?, self.featurename_bag.id(feature)?).ok()?;
        self.feature_bag.id(key).map(|id| self.weights[id])
    }

    /// Every trained pair as `(label, feature, weight)`, ordered by label id,
    /// then by feature id.
    pub fn features(&self) -> Vec<(&str, &str, f64)> {
        let mut ids: Vec<usize> = (0..self.feature_bag.len()).collect();
        ids.sort_by_key(|&id| self.feature_bag.keys()[id].label());
        ids.into_iter()
            .filter_map(|id| {
                let key = self.feature_bag.key(id)?;
                let label = self.label_bag.str(key.label())?;
                let feature = self.featurename_bag.str(key.feature())?;
                Some((label, feature, self.weights[id]))
            })
            .collect()
    }

    /// Classifies a sample; its label is ignored, as are unknown feature names.
    pub fn classify(&self, sample: &MeSample) -> Result<Classification, MaxentError> {
        if self.num_classes == 0 {
            return Err(MaxentError::EmptyModel);
        }
        let mut scores = vec![0.0; self.num_classes];
        let binary = sample.features.iter().map(|name| (name, 1.0));
        let real = sample.rvfeatures.iter().map(|(name, value)| (name, *value));
        for (name, value) in binary.chain(real) {
            let Some(f) = self.featurename_bag.id(name) else {
                continue;
            };
            for (label, score) in scores.iter_mut().enumerate() {
                if let Some(id) = self.feature_bag.id(FeatureKey::new(label, f)?) {
                    *score += self.weights[id] * value;
                }
            }
        }
        let class_id = conditional_probability(&mut scores);
        let label = self.label_bag.str(class_id).unwrap_or_default().to_string();
        Ok(Classification {
            label,
            class_id,
            probabilities: scores,
        })
    }
}

// Assigns ids in sample order to every (label, feature) pair that meets the
// cutoff. Counting is a separate pass so cutoff decisions do not depend on
// assignment order.
fn build_feature_bag(samples: &[Sample], cutoff: usize) -> Result<FeatureBag, MaxentError> {
    let mut count: HashMap<FeatureKey, usize> = HashMap::new();
    if cutoff > 0 {
        for sample in samples {
            let names = sample.features.iter().chain(sample.rvfeatures.iter().map(|(f, _)| f));
            for &f in names {
                *count.entry(FeatureKey::new(sample.label, f)?).or_insert(0) += 1;
            }
        }
    }
    let mut bag = FeatureBag::new();
    for sample in samples {
        let names = sample.features.iter().chain(sample.rvfeatures.iter().map(|(f, _)| f));
        for &f in names {
            let key = FeatureKey::new(sample.label, f)?;
            if cutoff > 0 && count.get(&key).copied().unwrap_or(0) < cutoff {
                continue;
            }
            bag.put(key);
        }
    }
    Ok(bag)
}
