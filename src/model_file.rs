//! Plain-text model persistence.
//!
//! One trained pair per line, `<label>\t<feature>\t<weight>`. Zero weights are
//! not written, except that a class with no non-zero weight gets a single
//! zero-weight line, so every class survives a reload with its id. The feature
//! name is everything between the first and the last tab, so it may itself
//! contain tabs; labels may not.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use ndarray::Array1;

use crate::features::FeatureKey;
use crate::maxent::{MaxentError, MeModel};

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> MaxentError {
    move |source| MaxentError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// Splits a model line at its first and last tab.
fn parse_line(line: &str) -> Result<(&str, &str, f64), String> {
    let (Some(first), Some(last)) = (line.find('\t'), line.rfind('\t')) else {
        return Err("expected <label>\\t<feature>\\t<weight>".to_string());
    };
    if first == last {
        return Err("expected <label>\\t<feature>\\t<weight>".to_string());
    }
    let weight = line[last + 1..].trim();
    let weight: f64 = weight
        .parse()
        .map_err(|_| format!("invalid weight '{weight}'"))?;
    Ok((&line[..first], &line[first + 1..last], weight))
}

impl MeModel {
    /// Writes every non-zero weight, ordered by label id.
    ///
    /// A class without non-zero weights is written as one zero-weight line,
    /// using its first trained feature or an empty feature name.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), MaxentError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(io_error(path))?;
        let mut out = BufWriter::new(file);
        let entries = self.features();
        let mut pairs = entries.iter().peekable();
        let mut written = 0usize;
        for class_id in 0..self.num_classes {
            let label = self.label_bag.str(class_id).unwrap_or_default();
            let mut first_feature = None;
            let mut kept = false;
            while let Some((_, feature, weight)) = pairs.next_if(|(l, _, _)| *l == label) {
                first_feature.get_or_insert(*feature);
                if *weight == 0.0 {
                    continue;
                }
                writeln!(out, "{label}\t{feature}\t{weight}").map_err(io_error(path))?;
                written += 1;
                kept = true;
            }
            if !kept {
                let feature = first_feature.unwrap_or_default();
                writeln!(out, "{label}\t{feature}\t0").map_err(io_error(path))?;
            }
        }
        out.flush().map_err(io_error(path))?;
        log::info!("[MaxEnt] saved {} weights to {}", written, path.display());
        Ok(())
    }

    /// Replaces the model with the one stored at `path`.
    ///
    /// Any queued training samples are discarded. On error the model is left
    /// unchanged.
    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), MaxentError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            log::error!("[MaxEnt] cannot open {}", path.display());
            io_error(path)(e)
        })?;

        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(io_error(path))?;
            if line.trim().is_empty() {
                continue;
            }
            let (label, feature, weight) = parse_line(&line).map_err(|reason| MaxentError::Parse {
                path: path.to_path_buf(),
                line: index + 1,
                reason,
            })?;
            entries.push((label.to_string(), feature.to_string(), weight));
        }

        self.load_from_entries(entries.iter().map(|(l, f, w)| (l.as_str(), f.as_str(), *w)))?;
        log::info!(
            "[MaxEnt] loaded {} weights, {} classes from {}",
            self.num_features(),
            self.num_classes(),
            path.display()
        );
        Ok(())
    }

    /// Replaces the model with `(label, feature, weight)` entries. Classes are
    /// numbered in order of first appearance; a repeated pair keeps its last
    /// weight.
    pub fn load_from_entries<'a, I>(&mut self, entries: I) -> Result<(), MaxentError>
    where
        I: IntoIterator<Item = (&'a str, &'a str, f64)>,
    {
        let mut model = MeModel::new();
        let mut weights = Vec::new();
        for (label, feature, weight) in entries {
            let label = model.intern_label(label)?;
            let feature = model.intern_feature(feature)?;
            let id = model.feature_bag.put(FeatureKey::new(label, feature)?);
            if id == weights.len() {
                weights.push(weight);
            } else {
                weights[id] = weight;
            }
        }
        model.weights = Array1::from(weights);
        model.num_classes = model.label_bag.len();
        *self = model;
        Ok(())
    }
}
