use rand::seq::index;
use rand::Rng;

// histogram of `labels[i]` for every i in `indices`
pub fn class_counts(labels: &[usize], indices: &[usize], n_classes: usize) -> Vec<usize> {
    let mut counts = vec![0usize; n_classes];
    for &i in indices {
        counts[labels[i]] += 1;
    }
    counts
}

// gini = 1 - sum(p_k^2)
pub fn gini(counts: &[usize]) -> f64 {
    let total = counts.iter().sum::<usize>();
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    1.0 - counts
        .iter()
        .map(|&c| {
            let p = c as f64 / total;
            p * p
        })
        .sum::<f64>()
}

// counts -> probabilities; an all-zero histogram stays all-zero
pub fn normalize(counts: &[usize]) -> Vec<f64> {
    let total = counts.iter().sum::<usize>();
    if total == 0 {
        return vec![0.0; counts.len()];
    }
    counts.iter().map(|&c| c as f64 / total as f64).collect()
}

// index of the largest value, ties go to the lowest index
pub fn argmax(x: &[f64]) -> usize {
    assert!(!x.is_empty(), "[ERROR] @argmax >> empty input");
    x.iter()
        .enumerate()
        .fold((0, x[0]), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
        .0
}

// y += x, element-wise
pub fn add_assign(y: &mut [f64], x: &[f64]) {
    assert!(
        y.len() == x.len(),
        "[ERROR] @add_assign >> length of X & Y is not the same"
    );
    y.iter_mut().zip(x).for_each(|(a, b)| *a += b);
}

// n draws with replacement from 0..n
pub fn bootstrap<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<usize> {
    (0..n).map(|_| rng.gen_range(0..n)).collect()
}

// k distinct feature indices out of n_features, k = max(1, floor(sqrt(n_features)))
pub fn sample_features<R: Rng + ?Sized>(n_features: usize, rng: &mut R) -> Vec<usize> {
    let k = ((n_features as f64).sqrt().floor() as usize).clamp(1, n_features);
    index::sample(rng, n_features, k).into_vec()
}

pub fn accuracy(predicted: &[usize], expected: &[usize]) -> f64 {
    assert!(
        predicted.len() == expected.len(),
        "[ERROR] @accuracy >> length of predictions & labels is not the same"
    );
    if expected.is_empty() {
        return 0.0;
    }
    let hits = predicted
        .iter()
        .zip(expected)
        .filter(|(p, e)| p == e)
        .count();
    hits as f64 / expected.len() as f64
}

#[test]
fn test_gini() {
    assert_eq!(gini(&[10, 0]), 0.0);
    assert!((gini(&[5, 5]) - 0.5).abs() < 1e-12);
    assert!((gini(&[1, 1, 1, 1]) - 0.75).abs() < 1e-12);
    assert_eq!(gini(&[0, 0]), 0.0);
}

#[test]
fn test_class_counts() {
    let labels = [0, 1, 1, 0, 1];
    assert_eq!(class_counts(&labels, &[0, 1, 2, 3, 4], 2), vec![2, 3]);
    assert_eq!(class_counts(&labels, &[1, 1, 3], 3), vec![1, 2, 0]);
}

#[test]
fn test_argmax_ties_to_lowest() {
    assert_eq!(argmax(&[0.2, 0.8]), 1);
    assert_eq!(argmax(&[0.5, 0.5]), 0);
    assert_eq!(argmax(&[0.1, 0.45, 0.45]), 1);
}

#[test]
fn test_normalize() {
    assert_eq!(normalize(&[1, 3]), vec![0.25, 0.75]);
    assert_eq!(normalize(&[0, 0]), vec![0.0, 0.0]);
}

#[test]
fn test_sampling() {
    use rand::{rngs::StdRng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(7);
    let sample = bootstrap(20, &mut rng);
    assert_eq!(sample.len(), 20);
    assert!(sample.iter().all(|&i| i < 20));

    let features = sample_features(3, &mut rng);
    assert_eq!(features.len(), 1);
    assert!(features[0] < 3);

    let mut features = sample_features(16, &mut rng);
    features.sort_unstable();
    features.dedup();
    assert_eq!(features.len(), 4);
}

#[test]
fn test_accuracy() {
    assert_eq!(accuracy(&[1, 0, 1, 1], &[1, 0, 0, 1]), 0.75);
    assert_eq!(accuracy(&[], &[]), 0.0);
}
