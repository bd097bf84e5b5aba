use crate::error::ModelError;
use rand::seq::SliceRandom;
use rand::Rng;

pub const FEATURES: [&str; 3] = ["unit_price", "quantity", "is_pro_customer"];

/// Row-major feature table with one class label per row.
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    feature_names: Vec<String>,
    rows: Vec<Vec<f64>>,
    labels: Vec<usize>,
}

impl Dataset {
    pub fn new(
        feature_names: Vec<String>,
        rows: Vec<Vec<f64>>,
        labels: Vec<usize>,
    ) -> Result<Self, ModelError> {
        if rows.len() != labels.len() {
            return Err(ModelError::LabelCount {
                rows: rows.len(),
                labels: labels.len(),
            });
        }
        if let Some(row) = rows.iter().find(|r| r.len() != feature_names.len()) {
            return Err(ModelError::FeatureCount {
                expected: feature_names.len(),
                actual: row.len(),
            });
        }
        Ok(Self {
            feature_names,
            rows,
            labels,
        })
    }

    /// Fake order lines: a bulk discount applies when `quantity * is_pro_customer > 10`.
    pub fn synthetic<R: Rng + ?Sized>(samples: usize, rng: &mut R) -> Self {
        let mut rows = Vec::with_capacity(samples);
        let mut labels = Vec::with_capacity(samples);
        for _ in 0..samples {
            let unit_price = rng.gen_range(50..500) as f64;
            let quantity = rng.gen_range(1..20) as i64;
            let is_pro_customer = rng.gen_range(0..2) as i64;
            rows.push(vec![unit_price, quantity as f64, is_pro_customer as f64]);
            labels.push(bulk_discount_rule(quantity, is_pro_customer));
        }
        Self {
            feature_names: FEATURES.iter().map(|s| s.to_string()).collect(),
            rows,
            labels,
        }
    }

    /// Shuffles and splits into (train, test); the test part holds `ceil(n * test_fraction)` rows.
    pub fn split<R: Rng + ?Sized>(&self, test_fraction: f64, rng: &mut R) -> (Self, Self) {
        let mut order = (0..self.len()).collect::<Vec<_>>();
        order.shuffle(rng);
        let n_test = ((self.len() as f64) * test_fraction).ceil() as usize;
        let n_test = n_test.min(self.len());
        let (test, train) = order.split_at(n_test);
        (self.select(train), self.select(test))
    }

    fn select(&self, indices: &[usize]) -> Self {
        Self {
            feature_names: self.feature_names.clone(),
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of classes, assuming labels are `0..=max`.
    pub fn n_classes(&self) -> usize {
        self.labels.iter().max().map_or(0, |m| m + 1)
    }
}

pub fn bulk_discount_rule(quantity: i64, is_pro_customer: i64) -> usize {
    (quantity * is_pro_customer > 10) as usize
}

#[test]
fn test_synthetic_ranges() {
    use rand::{rngs::StdRng, SeedableRng};

    let data = Dataset::synthetic(200, &mut StdRng::seed_from_u64(42));
    assert_eq!(data.len(), 200);
    assert_eq!(data.feature_names(), FEATURES);
    for (row, &label) in data.rows().iter().zip(data.labels()) {
        assert!((50.0..500.0).contains(&row[0]));
        assert!((1.0..20.0).contains(&row[1]));
        assert!(row[2] == 0.0 || row[2] == 1.0);
        assert_eq!(label, bulk_discount_rule(row[1] as i64, row[2] as i64));
    }
    assert_eq!(data.n_classes(), 2);
}

#[test]
fn test_synthetic_is_seeded() {
    use rand::{rngs::StdRng, SeedableRng};

    let a = Dataset::synthetic(50, &mut StdRng::seed_from_u64(1));
    let b = Dataset::synthetic(50, &mut StdRng::seed_from_u64(1));
    assert_eq!(a, b);
}

#[test]
fn test_split() {
    use rand::{rngs::StdRng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(3);
    let data = Dataset::synthetic(101, &mut rng);
    let (train, test) = data.split(0.2, &mut rng);
    assert_eq!(test.len(), 21);
    assert_eq!(train.len(), 80);
    assert_eq!(train.feature_names(), data.feature_names());
}

#[test]
fn test_new_validates_shape() {
    let names = vec!["a".to_string(), "b".to_string()];
    assert!(matches!(
        Dataset::new(names.clone(), vec![vec![1.0]], vec![0]),
        Err(ModelError::FeatureCount { expected: 2, actual: 1 })
    ));
    assert!(matches!(
        Dataset::new(names.clone(), vec![vec![1.0, 2.0]], vec![]),
        Err(ModelError::LabelCount { rows: 1, labels: 0 })
    ));
    assert!(Dataset::new(names, vec![vec![1.0, 2.0]], vec![1]).is_ok());
}
