//! Scalar math helpers shared by the reference evaluator, the VM, and tests

/// Logistic sigmoid: 1 / (1 + e^-x)
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Sigmoid derivative computed from an already-activated value
pub fn sigmoid_derivative(activation: f64) -> f64 {
    activation * (1.0 - activation)
}

/// Mean squared error over paired targets/outputs
pub fn mean_squared_error(targets: &[f64], outputs: &[f64]) -> f64 {
    debug_assert_eq!(targets.len(), outputs.len());
    let sum: f64 = targets
        .iter()
        .zip(outputs)
        .map(|(t, o)| (t - o) * (t - o))
        .sum();
    sum / outputs.len() as f64
}

/// Binary cross-entropy cost over paired targets/outputs
pub fn cross_entropy(targets: &[f64], outputs: &[f64]) -> f64 {
    debug_assert_eq!(targets.len(), outputs.len());
    let mut cost = 0.0;
    for (t, o) in targets.iter().zip(outputs) {
        cost -= t * (o + f64::MIN_POSITIVE).ln() + (1.0 - t) * (1.0 - o + f64::MIN_POSITIVE).ln();
    }
    cost
}

/// Fuzzy scalar comparison
pub fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
    (a - b).abs() <= epsilon
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid_midpoint_and_bounds() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(10.0) > 0.9999);
        assert!(sigmoid(-10.0) < 0.0001);
    }

    #[test]
    fn test_sigmoid_derivative_peaks_at_half() {
        assert_eq!(sigmoid_derivative(0.5), 0.25);
        assert!(sigmoid_derivative(0.9) < 0.25);
        assert!(sigmoid_derivative(0.1) < 0.25);
    }

    #[test]
    fn test_mean_squared_error() {
        let mse = mean_squared_error(&[1.0, 0.0], &[0.5, 0.5]);
        assert!(approx_eq(mse, 0.25, 1e-12));
    }

    #[test]
    fn test_cross_entropy_is_finite_at_extremes() {
        let cost = cross_entropy(&[1.0, 0.0], &[1.0, 0.0]);
        assert!(cost.is_finite());
        assert!(cost.abs() < 1e-9);
    }
}
