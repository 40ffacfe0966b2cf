
use crate::data_types::records::ClusterAssignment;

use log::{debug, info, trace, warn};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::{Continuous, Normal};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Component counts that are scored when the number of components is automatically selected
pub const AUTO_COMPONENT_RANGE: RangeInclusive<usize> = 2..=4;
/// Default seed for the mixture model initialization
pub const DEFAULT_SEED: u64 = 42;

#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    #[error("at least 2 components required, {num_components} requested")]
    TooFewComponents { num_components: usize },
    #[error("cannot fit {num_components} components to {num_observations} observations")]
    TooFewObservations { num_components: usize, num_observations: usize },
    #[error("mixture model fit with {num_components} components produced a non-finite likelihood")]
    DegenerateFit { num_components: usize }
}

/// Controls the mixture model fitting
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// number of mixture components; 0 selects it automatically by silhouette score
    pub num_components: usize,
    /// seed for the k-means initialization
    pub seed: u64,
    /// maximum number of EM iterations
    pub max_iterations: usize,
    /// EM stops once the mean log-likelihood changes by less than this
    pub tolerance: f64,
    /// added to every component variance to keep it positive
    pub reg_covar: f64,
    /// maximum number of Lloyd iterations during initialization
    pub kmeans_iterations: usize
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_components: 0,
            seed: DEFAULT_SEED,
            max_iterations: 100,
            tolerance: 1e-3,
            reg_covar: 1e-6,
            kmeans_iterations: 300
        }
    }
}

/// Output of clustering a set of observations
#[derive(Clone, Debug)]
pub struct ClusterResult {
    /// the most probable component for each observation
    pub labels: Vec<usize>,
    /// the posterior probability of that component for each observation
    pub max_probabilities: Vec<f64>,
    /// the number of components in the final model
    pub num_components: usize,
    /// the final model
    pub model: GaussianMixture
}

impl ClusterResult {
    /// Pairs each label with its posterior probability
    pub fn assignments(&self) -> Vec<ClusterAssignment> {
        self.labels.iter().zip(self.max_probabilities.iter())
            .map(|(&strain, &strain_proba)| ClusterAssignment { strain, strain_proba })
            .collect()
    }
}

/// A one-dimensional Gaussian mixture model fit with expectation-maximization
#[derive(Clone, Debug)]
pub struct GaussianMixture {
    weights: Vec<f64>,
    means: Vec<f64>,
    variances: Vec<f64>,
    /// true if EM reached the tolerance before the iteration limit
    converged: bool,
    /// number of EM iterations that were run
    iterations: usize,
    /// mean log-likelihood of the training data at the end of fitting
    log_likelihood: f64
}

/// Numerically stable log(sum(exp(values)))
fn log_sum_exp(values: &[f64]) -> f64 {
    let max_value: f64 = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_value.is_infinite() {
        return max_value;
    }
    let total: f64 = values.iter().map(|v| (v - max_value).exp()).sum();
    max_value + total.ln()
}

/// Hard assignment of each value to its nearest center, ties going to the lower index
fn nearest_centers(observations: &[f64], centers: &[f64]) -> Vec<usize> {
    observations.iter()
        .map(|&x| {
            let mut best: (usize, f64) = (0, f64::INFINITY);
            for (i, &c) in centers.iter().enumerate() {
                let distance = (x - c).abs();
                if distance < best.1 {
                    best = (i, distance);
                }
            }
            best.0
        })
        .collect()
}

/// One-dimensional k-means with k-means++ seeding, used to initialize the mixture.
/// Returns the label of each observation.
fn kmeans_labels(observations: &[f64], num_clusters: usize, max_iterations: usize, rng: &mut StdRng) -> Vec<usize> {
    // k-means++ seeding
    let mut centers: Vec<f64> = Vec::with_capacity(num_clusters);
    centers.push(observations[rng.gen_range(0..observations.len())]);
    while centers.len() < num_clusters {
        let distances: Vec<f64> = observations.iter()
            .map(|&x| centers.iter().map(|&c| (x - c).powi(2)).fold(f64::INFINITY, f64::min))
            .collect();
        let next_index: usize = match WeightedIndex::new(&distances) {
            Ok(dist) => dist.sample(rng),
            Err(_) => {
                // every point sits on a center already, so any choice is as good as another
                rng.gen_range(0..observations.len())
            }
        };
        centers.push(observations[next_index]);
    }

    // Lloyd iterations; empty clusters keep their previous center
    let mut labels: Vec<usize> = nearest_centers(observations, &centers);
    for iteration in 0..max_iterations {
        let mut sums: Vec<f64> = vec![0.0; num_clusters];
        let mut counts: Vec<usize> = vec![0; num_clusters];
        for (&x, &label) in observations.iter().zip(labels.iter()) {
            sums[label] += x;
            counts[label] += 1;
        }
        for (c, (&s, &n)) in centers.iter_mut().zip(sums.iter().zip(counts.iter())) {
            if n > 0 {
                *c = s / n as f64;
            }
        }

        let new_labels: Vec<usize> = nearest_centers(observations, &centers);
        if new_labels == labels {
            trace!("k-means converged after {} iterations", iteration + 1);
            break;
        }
        labels = new_labels;
    }
    labels
}

impl GaussianMixture {
    /// Fits a mixture with `num_components` components to the observations.
    /// # Arguments
    /// * `observations` - the values to fit
    /// * `num_components` - number of components, must be at least 2
    /// * `config` - seed, iteration limits, and regularization
    /// # Errors
    /// * `ClusterError::TooFewComponents` if `num_components` < 2
    /// * `ClusterError::TooFewObservations` if there are fewer observations than components
    /// * `ClusterError::DegenerateFit` if the likelihood becomes non-finite
    pub fn fit(observations: &[f64], num_components: usize, config: &ClusterConfig) -> Result<GaussianMixture, ClusterError> {
        if num_components < 2 {
            return Err(ClusterError::TooFewComponents { num_components });
        }
        if observations.len() < num_components {
            return Err(ClusterError::TooFewObservations { num_components, num_observations: observations.len() });
        }

        let mut rng: StdRng = StdRng::seed_from_u64(config.seed);
        let initial_labels: Vec<usize> = kmeans_labels(observations, num_components, config.kmeans_iterations, &mut rng);
        let mut responsibilities: Vec<Vec<f64>> = initial_labels.iter()
            .map(|&label| {
                let mut r = vec![0.0; num_components];
                r[label] = 1.0;
                r
            })
            .collect();

        let mut model = GaussianMixture {
            weights: vec![0.0; num_components],
            means: vec![0.0; num_components],
            variances: vec![0.0; num_components],
            converged: false,
            iterations: 0,
            log_likelihood: f64::NEG_INFINITY
        };
        model.maximization_step(observations, &responsibilities, config.reg_covar);

        for iteration in 1..=config.max_iterations {
            let previous: f64 = model.log_likelihood;
            let (log_likelihood, new_responsibilities) = model.expectation_step(observations)?;
            responsibilities = new_responsibilities;
            model.maximization_step(observations, &responsibilities, config.reg_covar);
            model.log_likelihood = log_likelihood;
            model.iterations = iteration;

            if (log_likelihood - previous).abs() < config.tolerance {
                model.converged = true;
                break;
            }
        }

        if !model.converged {
            warn!("Mixture model with {} components did not converge after {} iterations", num_components, model.iterations);
        }
        debug!("Fit {} components in {} iterations: weights={:?} means={:?} variances={:?}",
            num_components, model.iterations, model.weights, model.means, model.variances);
        Ok(model)
    }

    /// Re-estimates weights, means, and variances from the responsibilities
    fn maximization_step(&mut self, observations: &[f64], responsibilities: &[Vec<f64>], reg_covar: f64) {
        let num_components: usize = self.means.len();
        let num_observations: f64 = observations.len() as f64;
        for k in 0..num_components {
            let nk: f64 = responsibilities.iter().map(|r| r[k]).sum::<f64>() + 10.0 * f64::EPSILON;
            let mean: f64 = observations.iter().zip(responsibilities.iter())
                .map(|(&x, r)| r[k] * x)
                .sum::<f64>() / nk;
            let variance: f64 = observations.iter().zip(responsibilities.iter())
                .map(|(&x, r)| r[k] * (x - mean).powi(2))
                .sum::<f64>() / nk + reg_covar;
            self.weights[k] = nk / num_observations;
            self.means[k] = mean;
            self.variances[k] = variance;
        }
    }

    /// Weighted log-density of `value` under each component
    fn weighted_log_densities(&self, value: f64) -> Result<Vec<f64>, ClusterError> {
        let num_components: usize = self.means.len();
        self.means.iter().zip(self.variances.iter()).zip(self.weights.iter())
            .map(|((&mean, &variance), &weight)| {
                let normal = Normal::new(mean, variance.sqrt())
                    .map_err(|_| ClusterError::DegenerateFit { num_components })?;
                Ok(normal.ln_pdf(value) + weight.ln())
            })
            .collect()
    }

    /// Computes the responsibilities of every component for every observation.
    /// Returns the mean log-likelihood and the responsibilities.
    fn expectation_step(&self, observations: &[f64]) -> Result<(f64, Vec<Vec<f64>>), ClusterError> {
        let mut total: f64 = 0.0;
        let mut responsibilities: Vec<Vec<f64>> = Vec::with_capacity(observations.len());
        for &x in observations.iter() {
            let log_densities: Vec<f64> = self.weighted_log_densities(x)?;
            let log_norm: f64 = log_sum_exp(&log_densities);
            if !log_norm.is_finite() {
                return Err(ClusterError::DegenerateFit { num_components: self.means.len() });
            }
            total += log_norm;
            responsibilities.push(log_densities.iter().map(|ld| (ld - log_norm).exp()).collect());
        }
        Ok((total / observations.len() as f64, responsibilities))
    }

    /// Posterior probability of each component for a single value
    pub fn posteriors(&self, value: f64) -> Result<Vec<f64>, ClusterError> {
        let log_densities: Vec<f64> = self.weighted_log_densities(value)?;
        let log_norm: f64 = log_sum_exp(&log_densities);
        if !log_norm.is_finite() {
            return Err(ClusterError::DegenerateFit { num_components: self.means.len() });
        }
        Ok(log_densities.iter().map(|ld| (ld - log_norm).exp()).collect())
    }

    /// Returns the most probable component of each observation and its posterior probability.
    /// Ties go to the lower component index.
    /// # Errors
    /// * `ClusterError::DegenerateFit` if a posterior cannot be computed
    pub fn predict(&self, observations: &[f64]) -> Result<(Vec<usize>, Vec<f64>), ClusterError> {
        let mut labels: Vec<usize> = Vec::with_capacity(observations.len());
        let mut max_probabilities: Vec<f64> = Vec::with_capacity(observations.len());
        for &x in observations.iter() {
            let posteriors: Vec<f64> = self.posteriors(x)?;
            let mut best: (usize, f64) = (0, f64::NEG_INFINITY);
            for (k, &p) in posteriors.iter().enumerate() {
                if p > best.1 {
                    best = (k, p);
                }
            }
            labels.push(best.0);
            max_probabilities.push(best.1);
        }
        Ok((labels, max_probabilities))
    }

    pub fn num_components(&self) -> usize {
        self.means.len()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn means(&self) -> &[f64] {
        &self.means
    }

    pub fn variances(&self) -> &[f64] {
        &self.variances
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }
}

/// Sum of |x - v| over a sorted cluster, using its prefix sums
fn total_distance(x: f64, sorted_values: &[f64], prefix_sums: &[f64]) -> f64 {
    let split: usize = sorted_values.partition_point(|&v| v < x);
    let count: usize = sorted_values.len();
    let below: f64 = x * split as f64 - prefix_sums[split];
    let above: f64 = (prefix_sums[count] - prefix_sums[split]) - x * (count - split) as f64;
    below + above
}

/// Mean silhouette coefficient of a one-dimensional clustering using absolute distance.
/// Returns None unless there are between 2 and `observations.len() - 1` distinct labels.
/// Points in singleton clusters score 0.
pub fn silhouette_score(observations: &[f64], labels: &[usize]) -> Option<f64> {
    assert_eq!(observations.len(), labels.len());

    let mut clusters: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    for (&x, &label) in observations.iter().zip(labels.iter()) {
        clusters.entry(label).or_default().push(x);
    }
    if clusters.len() < 2 || clusters.len() >= observations.len() {
        return None;
    }

    // sorted values and prefix sums for each cluster
    let mut cluster_sums: BTreeMap<usize, (Vec<f64>, Vec<f64>)> = BTreeMap::new();
    for (label, mut values) in clusters.into_iter() {
        values.sort_by(|a, b| a.total_cmp(b));
        let mut prefix_sums: Vec<f64> = Vec::with_capacity(values.len() + 1);
        prefix_sums.push(0.0);
        for &v in values.iter() {
            let last: f64 = prefix_sums[prefix_sums.len() - 1];
            prefix_sums.push(last + v);
        }
        cluster_sums.insert(label, (values, prefix_sums));
    }

    let mut total: f64 = 0.0;
    for (&x, label) in observations.iter().zip(labels.iter()) {
        let (own_values, own_sums) = &cluster_sums[label];
        if own_values.len() == 1 {
            continue;
        }
        let intra: f64 = total_distance(x, own_values, own_sums) / (own_values.len() - 1) as f64;
        let nearest_other: f64 = cluster_sums.iter()
            .filter(|(other_label, _)| *other_label != label)
            .map(|(_, (values, sums))| total_distance(x, values, sums) / values.len() as f64)
            .fold(f64::INFINITY, f64::min);
        let denominator: f64 = intra.max(nearest_other);
        if denominator > 0.0 {
            total += (nearest_other - intra) / denominator;
        }
    }
    Some(total / observations.len() as f64)
}

/// Picks the component count with the highest score, scanning in the given order.
/// The search starts from the first candidate with a score of 0.0, and a later candidate only replaces the current best with a strictly greater score.
/// Candidates that could not be scored are ignored.
pub fn select_best_candidate(scores: &[(usize, Option<f64>)]) -> Option<usize> {
    let (first_components, _) = scores.first()?;
    let mut best: (usize, f64) = (*first_components, 0.0);
    for &(num_components, score) in scores.iter() {
        if let Some(s) = score {
            if s > best.1 {
                best = (num_components, s);
            }
        }
    }
    Some(best.0)
}

/// Fits a mixture for every count in `AUTO_COMPONENT_RANGE` and keeps the one with the best silhouette score.
/// # Errors
/// * if a candidate fit fails, or if there are too few observations for any candidate
fn select_num_components(observations: &[f64], config: &ClusterConfig) -> Result<GaussianMixture, ClusterError> {
    let min_components: usize = *AUTO_COMPONENT_RANGE.start();
    if observations.len() < min_components {
        return Err(ClusterError::TooFewObservations { num_components: min_components, num_observations: observations.len() });
    }

    let mut scores: Vec<(usize, Option<f64>)> = vec![];
    let mut models: Vec<GaussianMixture> = vec![];
    for num_components in AUTO_COMPONENT_RANGE {
        if observations.len() < num_components {
            warn!("Skipping {} components, only {} observations", num_components, observations.len());
            continue;
        }
        let model = GaussianMixture::fit(observations, num_components, config)?;
        let (labels, _) = model.predict(observations)?;
        let score: Option<f64> = silhouette_score(observations, &labels);
        match score {
            Some(s) => info!("Silhouette score with {} components: {:.6}", num_components, s),
            None => warn!("Mixture with {} components collapsed to a single cluster, skipping", num_components)
        };
        scores.push((num_components, score));
        models.push(model);
    }

    let best_components: usize = select_best_candidate(&scores).unwrap_or(min_components);
    info!("Selected {} components by silhouette score", best_components);

    // every candidate shares the same seed, so the scanned model is the refit model
    let best_model: GaussianMixture = models.into_iter()
        .find(|m| m.num_components() == best_components)
        .ok_or(ClusterError::TooFewObservations { num_components: best_components, num_observations: observations.len() })?;
    Ok(best_model)
}

/// Clusters one-dimensional observations with a Gaussian mixture model.
/// # Arguments
/// * `observations` - the feature values, one per observation
/// * `config` - `num_components` of 0 selects the count automatically from `AUTO_COMPONENT_RANGE`
/// # Errors
/// * `ClusterError::TooFewComponents` if exactly 1 component is requested
/// * any error from fitting the model
pub fn cluster_observations(observations: &[f64], config: &ClusterConfig) -> Result<ClusterResult, ClusterError> {
    let model: GaussianMixture = match config.num_components {
        0 => {
            warn!("The number of components is 0, it will be selected using the silhouette score.");
            select_num_components(observations, config)?
        },
        1 => return Err(ClusterError::TooFewComponents { num_components: 1 }),
        num_components => GaussianMixture::fit(observations, num_components, config)?
    };

    let (labels, max_probabilities) = model.predict(observations)?;
    Ok(ClusterResult {
        labels,
        max_probabilities,
        num_components: model.num_components(),
        model
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// tight groups of values around each center
    fn grouped_values(centers: &[f64], per_group: usize) -> Vec<f64> {
        let mut values = vec![];
        for i in 0..per_group {
            for &c in centers.iter() {
                values.push(c + 0.002 * (i % 7) as f64 - 0.006);
            }
        }
        values
    }

    #[test]
    fn test_log_sum_exp() {
        let values = [0.5_f64.ln(), 0.25_f64.ln(), 0.25_f64.ln()];
        assert!(log_sum_exp(&values).abs() < 1e-12);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_silhouette_score() {
        let observations = vec![0.0, 1.0, 10.0, 11.0];
        let labels = vec![0, 0, 1, 1];
        let expected: f64 = (2.0 * (9.5 / 10.5) + 2.0 * (8.5 / 9.5)) / 4.0;
        let score = silhouette_score(&observations, &labels).unwrap();
        assert!((score - expected).abs() < 1e-12);

        // one label or all unique labels cannot be scored
        assert_eq!(silhouette_score(&observations, &[0, 0, 0, 0]), None);
        assert_eq!(silhouette_score(&observations, &[0, 1, 2, 3]), None);

        // the singleton point contributes 0
        let singleton = silhouette_score(&[0.0, 1.0, 10.0], &[0, 0, 5]).unwrap();
        let expected: f64 = ((9.0 / 10.0) + (8.0 / 9.0)) / 3.0;
        assert!((singleton - expected).abs() < 1e-12);
    }

    #[test]
    fn test_select_best_candidate() {
        // first max wins
        assert_eq!(select_best_candidate(&[(2, Some(0.5)), (3, Some(0.5)), (4, Some(0.4))]), Some(2));
        assert_eq!(select_best_candidate(&[(2, Some(0.5)), (3, Some(0.6)), (4, Some(0.6))]), Some(3));
        // unscored candidates are ignored
        assert_eq!(select_best_candidate(&[(2, None), (3, Some(0.3)), (4, Some(0.1))]), Some(3));
        // nothing beats the starting score of 0.0
        assert_eq!(select_best_candidate(&[(2, Some(-0.2)), (3, Some(0.0)), (4, None)]), Some(2));
        assert_eq!(select_best_candidate(&[]), None);
    }

    #[test]
    fn test_two_components() {
        let observations = grouped_values(&[0.1, 0.9], 20);
        let config = ClusterConfig { num_components: 2, ..Default::default() };
        let result = cluster_observations(&observations, &config).unwrap();
        assert_eq!(result.num_components, 2);
        assert!(result.model.converged());

        // labels are arbitrary, but the partition is not
        let low_label = result.labels[0];
        for (&x, &label) in observations.iter().zip(result.labels.iter()) {
            if x < 0.5 {
                assert_eq!(label, low_label);
            } else {
                assert_ne!(label, low_label);
            }
        }
        assert!(result.max_probabilities.iter().all(|&p| p > 0.99 && p <= 1.0));

        let weight_sum: f64 = result.model.weights().iter().sum();
        assert!((weight_sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_seeded_fit_is_reproducible() {
        let observations = grouped_values(&[0.05, 0.3, 0.55, 0.95], 15);
        let config = ClusterConfig { num_components: 3, seed: 7, ..Default::default() };
        let a = cluster_observations(&observations, &config).unwrap();
        let b = cluster_observations(&observations, &config).unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.max_probabilities, b.max_probabilities);
        assert_eq!(a.model.means(), b.model.means());
    }

    #[test]
    fn test_auto_select_components() {
        let observations = grouped_values(&[0.1, 0.5, 0.9], 20);
        let config = ClusterConfig { num_components: 0, ..Default::default() };
        let result = cluster_observations(&observations, &config).unwrap();
        assert_eq!(result.num_components, 3);

        let observations = grouped_values(&[0.1, 0.9], 20);
        let result = cluster_observations(&observations, &config).unwrap();
        assert_eq!(result.num_components, 2);
    }

    #[test]
    fn test_invalid_components() {
        let observations = grouped_values(&[0.1, 0.9], 5);
        let config = ClusterConfig { num_components: 1, ..Default::default() };
        assert!(matches!(
            cluster_observations(&observations, &config),
            Err(ClusterError::TooFewComponents { num_components: 1 })
        ));

        let config = ClusterConfig { num_components: 3, ..Default::default() };
        assert!(matches!(
            cluster_observations(&[0.1, 0.2], &config),
            Err(ClusterError::TooFewObservations { .. })
        ));

        let config = ClusterConfig { num_components: 0, ..Default::default() };
        assert!(matches!(
            cluster_observations(&[], &config),
            Err(ClusterError::TooFewObservations { .. })
        ));
    }

    #[test]
    fn test_identical_observations() {
        // no spread at all should still produce finite probabilities
        let observations = vec![0.5; 10];
        let config = ClusterConfig { num_components: 2, ..Default::default() };
        let result = cluster_observations(&observations, &config).unwrap();
        assert_eq!(result.labels.len(), 10);
        assert!(result.max_probabilities.iter().all(|p| p.is_finite() && *p >= 0.5));
    }
}
