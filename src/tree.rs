use crate::operators::{self as OP};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TreeParams {
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: None,
            min_samples_split: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        proba: Vec<f64>,
    },
}

/// CART classification tree stored as a flat arena; node 0 is the root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<Node>,
}

struct Builder<'a, R: ?Sized> {
    rows: &'a [Vec<f64>],
    labels: &'a [usize],
    n_classes: usize,
    params: TreeParams,
    nodes: Vec<Node>,
    rng: &'a mut R,
}

struct Split {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

impl DecisionTree {
    /// Grows a tree on `indices` (may contain duplicates, as bootstrap samples do).
    pub fn fit<R: Rng + ?Sized>(
        rows: &[Vec<f64>],
        labels: &[usize],
        indices: &[usize],
        n_classes: usize,
        params: TreeParams,
        rng: &mut R,
    ) -> Self {
        let mut builder = Builder {
            rows,
            labels,
            n_classes,
            params,
            nodes: Vec::new(),
            rng,
        };
        builder.grow(indices.to_vec(), 0);
        Self {
            nodes: builder.nodes,
        }
    }

    /// Checks the arena of a deserialized tree: splits must name a feature below
    /// `n_features` and point at later nodes, leaves must hold `n_classes` probabilities.
    pub fn validate(&self, n_features: usize, n_classes: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".into());
        }
        for (at, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Split {
                    feature,
                    left,
                    right,
                    ..
                } => {
                    if *feature >= n_features {
                        return Err(format!(
                            "node {at} splits on feature {feature}, model has {n_features}"
                        ));
                    }
                    // children after the parent rules out cycles
                    for child in [left, right] {
                        if *child <= at || *child >= self.nodes.len() {
                            return Err(format!("node {at} has out-of-range child {child}"));
                        }
                    }
                }
                Node::Leaf { proba } if proba.len() != n_classes => {
                    return Err(format!(
                        "leaf {at} holds {} probabilities, model has {n_classes} classes",
                        proba.len()
                    ));
                }
                Node::Leaf { .. } => {}
            }
        }
        Ok(())
    }

    pub fn predict_proba(&self, row: &[f64]) -> &[f64] {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => at = if row[*feature] <= *threshold { *left } else { *right },
                Node::Leaf { proba } => return proba,
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], at: usize) -> usize {
            match &nodes[at] {
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
                Node::Leaf { .. } => 0,
            }
        }
        walk(&self.nodes, 0)
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }
}

impl<R: Rng + ?Sized> Builder<'_, R> {
    fn grow(&mut self, indices: Vec<usize>, depth: usize) -> usize {
        let counts = OP::class_counts(self.labels, &indices, self.n_classes);
        let pure = counts.iter().filter(|&&c| c > 0).count() <= 1;
        let too_small = indices.len() < self.params.min_samples_split;
        let too_deep = self.params.max_depth.is_some_and(|d| depth >= d);

        let split = if pure || too_small || too_deep {
            None
        } else {
            self.best_split(&indices)
        };

        let Some(split) = split else {
            self.nodes.push(Node::Leaf {
                proba: OP::normalize(&counts),
            });
            return self.nodes.len() - 1;
        };

        // reserve the slot so children land after their parent
        let at = self.nodes.len();
        self.nodes.push(Node::Leaf { proba: Vec::new() });

        let (left, right): (Vec<_>, Vec<_>) = indices
            .into_iter()
            .partition(|&i| self.rows[i][split.feature] <= split.threshold);
        let left = self.grow(left, depth + 1);
        let right = self.grow(right, depth + 1);
        self.nodes[at] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        at
    }

    // Tries the random feature subset first; falls back to the remaining
    // features only when none of the subset can separate the samples.
    fn best_split(&mut self, indices: &[usize]) -> Option<Split> {
        let n_features = self.rows[indices[0]].len();
        let candidates = OP::sample_features(n_features, &mut *self.rng);
        if let Some(split) = self.best_split_among(indices, &candidates) {
            return Some(split);
        }
        let mut rest = (0..n_features)
            .filter(|f| !candidates.contains(f))
            .collect::<Vec<_>>();
        rest.shuffle(&mut *self.rng);
        rest.into_iter()
            .find_map(|f| self.best_split_among(indices, &[f]))
    }

    fn best_split_among(&self, indices: &[usize], features: &[usize]) -> Option<Split> {
        let mut best: Option<Split> = None;
        for &feature in features {
            let mut sorted = indices.to_vec();
            sorted.sort_by(|&a, &b| self.rows[a][feature].total_cmp(&self.rows[b][feature]));

            let mut left = vec![0usize; self.n_classes];
            let mut right = OP::class_counts(self.labels, &sorted, self.n_classes);
            let n = sorted.len() as f64;

            for k in 0..sorted.len() - 1 {
                let label = self.labels[sorted[k]];
                left[label] += 1;
                right[label] -= 1;

                let here = self.rows[sorted[k]][feature];
                let next = self.rows[sorted[k + 1]][feature];
                if here == next {
                    continue;
                }
                let n_left = (k + 1) as f64;
                let impurity =
                    (n_left * OP::gini(&left) + (n - n_left) * OP::gini(&right)) / n;
                if best.as_ref().map_or(true, |b| impurity < b.impurity) {
                    best = Some(Split {
                        feature,
                        threshold: here + (next - here) / 2.0,
                        impurity,
                    });
                }
            }
        }
        best
    }
}

#[test]
fn test_fits_separable_data() {
    use rand::{rngs::StdRng, SeedableRng};

    let rows = vec![vec![1.0], vec![2.0], vec![3.0], vec![10.0], vec![11.0], vec![12.0]];
    let labels = vec![0, 0, 0, 1, 1, 1];
    let indices = (0..rows.len()).collect::<Vec<_>>();
    let tree = DecisionTree::fit(
        &rows,
        &labels,
        &indices,
        2,
        TreeParams::default(),
        &mut StdRng::seed_from_u64(0),
    );

    assert_eq!(tree.depth(), 1);
    assert_eq!(tree.n_leaves(), 2);
    assert_eq!(tree.predict_proba(&[0.0]), &[1.0, 0.0]);
    assert_eq!(tree.predict_proba(&[6.0]), &[1.0, 0.0]);
    assert_eq!(tree.predict_proba(&[7.0]), &[0.0, 1.0]);
}

#[test]
fn test_learns_interaction() {
    use rand::{rngs::StdRng, SeedableRng};

    // label = quantity * pro > 10, column 0 is noise
    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for q in 1..20 {
        for pro in 0..2 {
            rows.push(vec![(q * 7 % 13) as f64, q as f64, pro as f64]);
            labels.push((q * pro > 10) as usize);
        }
    }
    let indices = (0..rows.len()).collect::<Vec<_>>();
    let tree = DecisionTree::fit(
        &rows,
        &labels,
        &indices,
        2,
        TreeParams::default(),
        &mut StdRng::seed_from_u64(5),
    );
    for (row, &label) in rows.iter().zip(&labels) {
        assert_eq!(OP::argmax(tree.predict_proba(row)), label);
    }
}

#[test]
fn test_max_depth_and_constant_features() {
    use rand::{rngs::StdRng, SeedableRng};

    let rows = vec![vec![1.0, 5.0], vec![2.0, 5.0], vec![3.0, 5.0], vec![4.0, 5.0]];
    let labels = vec![0, 1, 0, 1];
    let indices = (0..rows.len()).collect::<Vec<_>>();
    let params = TreeParams {
        max_depth: Some(1),
        min_samples_split: 2,
    };
    let mut rng = StdRng::seed_from_u64(9);
    let tree = DecisionTree::fit(&rows, &labels, &indices, 2, params, &mut rng);
    assert!(tree.depth() <= 1);

    // identical rows with mixed labels cannot be split
    let rows = vec![vec![1.0, 1.0], vec![1.0, 1.0]];
    let tree = DecisionTree::fit(&rows, &[0, 1], &[0, 1], 2, TreeParams::default(), &mut rng);
    assert_eq!(tree.depth(), 0);
    assert_eq!(tree.predict_proba(&[1.0, 1.0]), &[0.5, 0.5]);
}

#[test]
fn test_validate() {
    use rand::{rngs::StdRng, SeedableRng};

    let rows = vec![vec![1.0, 0.0], vec![2.0, 0.0], vec![8.0, 1.0], vec![9.0, 1.0]];
    let labels = vec![0, 0, 1, 1];
    let tree = DecisionTree::fit(
        &rows,
        &labels,
        &[0, 1, 2, 3],
        2,
        TreeParams::default(),
        &mut StdRng::seed_from_u64(1),
    );
    assert_eq!(tree.validate(2, 2), Ok(()));
    assert!(tree.validate(2, 3).is_err());

    let parse = |json: &str| serde_json::from_str::<DecisionTree>(json).unwrap();
    let bad = [
        r#"{"nodes":[]}"#,
        r#"{"nodes":[{"kind":"split","feature":7,"threshold":1.0,"left":1,"right":2},
            {"kind":"leaf","proba":[1.0,0.0]},{"kind":"leaf","proba":[0.0,1.0]}]}"#,
        r#"{"nodes":[{"kind":"split","feature":0,"threshold":1.0,"left":0,"right":1},
            {"kind":"leaf","proba":[1.0,0.0]}]}"#,
        r#"{"nodes":[{"kind":"split","feature":0,"threshold":1.0,"left":1,"right":5},
            {"kind":"leaf","proba":[1.0,0.0]}]}"#,
        r#"{"nodes":[{"kind":"leaf","proba":[1.0]}]}"#,
    ];
    for json in bad {
        assert!(parse(json).validate(2, 2).is_err(), "{json}");
    }
}
