use crate::dataset::Dataset;
use crate::error::ModelError;
use crate::operators::{self as OP};
use crate::tree::{DecisionTree, TreeParams};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub tree: TreeParams,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 50,
            tree: TreeParams::default(),
        }
    }
}

/// Bagged ensemble of CART trees, predicting by soft vote.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    feature_names: Vec<String>, // column order expected by `predict`
    n_classes: usize,
    trees: Vec<DecisionTree>,
}

impl RandomForest {
    pub fn fit<R: Rng + ?Sized>(
        data: &Dataset,
        params: ForestParams,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        if data.is_empty() {
            return Err(ModelError::EmptyDataset);
        }
        // keep a binary model even when the sample happens to hold one class
        let n_classes = data.n_classes().max(2);
        let trees = (0..params.n_estimators.max(1))
            .map(|_| {
                let sample = OP::bootstrap(data.len(), &mut *rng);
                DecisionTree::fit(
                    data.rows(),
                    data.labels(),
                    &sample,
                    n_classes,
                    params.tree,
                    &mut *rng,
                )
            })
            .collect();

        Ok(Self {
            feature_names: data.feature_names().to_vec(),
            n_classes,
            trees,
        })
    }

    pub fn predict_proba(&self, row: &[f64]) -> Result<Vec<f64>, ModelError> {
        if row.len() != self.feature_names.len() {
            return Err(ModelError::FeatureCount {
                expected: self.feature_names.len(),
                actual: row.len(),
            });
        }
        let mut proba = vec![0.0; self.n_classes];
        for tree in &self.trees {
            OP::add_assign(&mut proba, tree.predict_proba(row));
        }
        let n = self.trees.len() as f64;
        proba.iter_mut().for_each(|p| *p /= n);
        Ok(proba)
    }

    pub fn predict(&self, row: &[f64]) -> Result<usize, ModelError> {
        Ok(OP::argmax(&self.predict_proba(row)?))
    }

    /// Mean accuracy over `data`.
    pub fn score(&self, data: &Dataset) -> Result<f64, ModelError> {
        let predicted = data
            .rows()
            .iter()
            .map(|row| self.predict(row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(OP::accuracy(&predicted, data.labels()))
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn n_estimators(&self) -> usize {
        self.trees.len()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let path = path.as_ref();
        let io = |source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io)?;
        }
        let mut writer = BufWriter::new(File::create(path).map_err(io)?);
        serde_json::to_writer(&mut writer, self).map_err(|source| ModelError::Format {
            path: path.to_path_buf(),
            source,
        })?;
        writer.flush().map_err(io)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let model: Self =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| ModelError::Format {
                path: path.to_path_buf(),
                source,
            })?;
        model.validate().map_err(|reason| ModelError::Invalid {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(model)
    }

    // A loaded artefact is untrusted; every tree must be walkable for any row
    // of `feature_names.len()` values.
    fn validate(&self) -> Result<(), String> {
        if self.feature_names.is_empty() {
            return Err("model has no features".into());
        }
        if self.n_classes == 0 {
            return Err("model has no classes".into());
        }
        if self.trees.is_empty() {
            return Err("model has no trees".into());
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate(self.feature_names.len(), self.n_classes)
                .map_err(|reason| format!("tree {i}: {reason}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_forest() -> RandomForest {
    use rand::{rngs::StdRng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(42);
    let data = Dataset::synthetic(500, &mut rng);
    RandomForest::fit(&data, ForestParams::default(), &mut rng).unwrap()
}

#[test]
fn test_forest_follows_rule() {
    let forest = test_forest();
    assert_eq!(forest.n_estimators(), 50);
    assert_eq!(forest.predict(&[100.0, 19.0, 1.0]).unwrap(), 1);
    assert_eq!(forest.predict(&[100.0, 2.0, 1.0]).unwrap(), 0);
    assert_eq!(forest.predict(&[100.0, 19.0, 0.0]).unwrap(), 0);

    let proba = forest.predict_proba(&[250.0, 15.0, 1.0]).unwrap();
    assert_eq!(proba.len(), 2);
    assert!((proba.iter().sum::<f64>() - 1.0).abs() < 1e-9);
}

#[test]
fn test_held_out_accuracy() {
    use rand::{rngs::StdRng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(42);
    let data = Dataset::synthetic(500, &mut rng);
    let (train, test) = data.split(0.2, &mut rng);
    let forest = RandomForest::fit(&train, ForestParams::default(), &mut rng).unwrap();
    assert!(forest.score(&test).unwrap() >= 0.9);
}

#[test]
fn test_rejects_bad_input() {
    use rand::{rngs::StdRng, SeedableRng};

    let empty = Dataset::new(vec!["x".into()], vec![], vec![]).unwrap();
    let err = RandomForest::fit(&empty, ForestParams::default(), &mut StdRng::seed_from_u64(0));
    assert!(matches!(err, Err(ModelError::EmptyDataset)));

    let forest = test_forest();
    assert!(matches!(
        forest.predict(&[1.0, 2.0]),
        Err(ModelError::FeatureCount { expected: 3, actual: 2 })
    ));
}

#[test]
fn test_save_and_load() {
    let forest = test_forest();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("model.json");
    forest.save(&path).unwrap();

    let loaded = RandomForest::load(&path).unwrap();
    assert_eq!(loaded.feature_names(), forest.feature_names());
    for row in [[120.0, 12.0, 1.0], [60.0, 3.0, 0.0], [499.0, 11.0, 1.0]] {
        assert_eq!(loaded.predict(&row).unwrap(), forest.predict(&row).unwrap());
    }

    assert!(matches!(
        RandomForest::load(dir.path().join("missing.json")),
        Err(ModelError::Io { .. })
    ));
    std::fs::write(dir.path().join("bad.json"), "not a model").unwrap();
    assert!(matches!(
        RandomForest::load(dir.path().join("bad.json")),
        Err(ModelError::Format { .. })
    ));
}

#[test]
fn test_load_rejects_broken_artefacts() {
    let dir = tempfile::tempdir().unwrap();
    let leaf = r#"{"kind":"leaf","proba":[1.0,0.0]}"#;
    let split = r#"{"kind":"split","feature":7,"threshold":1.0,"left":1,"right":2}"#;
    let cases = [
        // split on a feature the model does not have
        format!(
            r#"{{"feature_names":["a","b","c"],"n_classes":2,"trees":[{{"nodes":[
                {split},{leaf},{leaf}]}}]}}"#
        ),
        // leaf with the wrong number of classes
        r#"{"feature_names":["a","b","c"],"n_classes":2,"trees":[{"nodes":[
            {"kind":"leaf","proba":[1.0]}]}]}"#
            .to_string(),
        r#"{"feature_names":["a","b","c"],"n_classes":2,"trees":[]}"#.to_string(),
        format!(r#"{{"feature_names":["a"],"n_classes":0,"trees":[{{"nodes":[{leaf}]}}]}}"#),
    ];
    for (i, json) in cases.iter().enumerate() {
        let path = dir.path().join(format!("broken-{i}.json"));
        std::fs::write(&path, json).unwrap();
        let err = RandomForest::load(&path).unwrap_err();
        assert!(matches!(err, ModelError::Invalid { .. }), "case {i}: {err}");
    }

    let path = dir.path().join("ok.json");
    let json = format!(
        r#"{{"feature_names":["a","b","c"],"n_classes":2,"trees":[{{"nodes":[{leaf}]}}]}}"#
    );
    std::fs::write(&path, json).unwrap();
    let model = RandomForest::load(&path).unwrap();
    assert_eq!(model.predict(&[1.0, 2.0, 3.0]).unwrap(), 0);
}
