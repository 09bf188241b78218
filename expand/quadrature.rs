//! Gauss-Legendre quadrature on `[-1, 1]`.
//!
//! An `n`-point rule integrates polynomials up to degree `2n - 1` exactly. The
//! roughness penalty integrates products of spline second derivatives, which are
//! polynomials of degree `2 * (degree - 2)` on each knot interval, so a rule
//! with `degree` points is exact there.

use std::f64::consts::PI;

const NEWTON_TOLERANCE: f64 = 1e-15;
const NEWTON_MAX_STEPS: usize = 100;

/// Nodes and weights of the `n`-point Gauss-Legendre rule, nodes ascending.
///
/// Nodes are the roots of the Legendre polynomial `P_n`, found by Newton
/// iteration from the Chebyshev-like initial guess `cos(π (i + 0.75) / (n + 0.5))`.
/// The weights are `2 / ((1 - x²) P_n'(x)²)`.
pub fn gauss_legendre(n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut nodes = vec![0.0; n];
    let mut weights = vec![0.0; n];
    let half = n.div_ceil(2);

    for i in 0..half {
        let mut x = (PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        for _ in 0..NEWTON_MAX_STEPS {
            let (value, slope) = legendre_with_derivative(n, x);
            let step = value / slope;
            x -= step;
            if step.abs() < NEWTON_TOLERANCE {
                break;
            }
        }
        let derivative = legendre_with_derivative(n, x).1;
        let weight = 2.0 / ((1.0 - x * x) * derivative * derivative);
        // Roots come out descending from +1; mirror them into ascending order.
        nodes[i] = -x;
        nodes[n - 1 - i] = x;
        weights[i] = weight;
        weights[n - 1 - i] = weight;
    }

    (nodes, weights)
}

/// `(P_n(x), P_n'(x))` via the three-term recurrence.
fn legendre_with_derivative(n: usize, x: f64) -> (f64, f64) {
    let mut current = 1.0;
    let mut previous = 0.0;
    for k in 1..=n {
        let older = previous;
        previous = current;
        current = ((2 * k - 1) as f64 * x * previous - (k - 1) as f64 * older) / k as f64;
    }
    let derivative = n as f64 * (x * current - previous) / (x * x - 1.0);
    (current, derivative)
}

/// Maps a rule on `[-1, 1]` onto `[a, b]`, yielding `(node, weight)` pairs with
/// the interval's half-width folded into the weights.
pub fn rescale<'a>(
    nodes: &'a [f64],
    weights: &'a [f64],
    a: f64,
    b: f64,
) -> impl Iterator<Item = (f64, f64)> + 'a {
    let half_width = 0.5 * (b - a);
    let midpoint = 0.5 * (a + b);
    nodes
        .iter()
        .zip(weights)
        .map(move |(&node, &weight)| (midpoint + half_width * node, weight * half_width))
}

/// Integrates `f` over `[a, b]` with the given rule.
pub fn integrate<F>(nodes: &[f64], weights: &[f64], a: f64, b: f64, mut f: F) -> f64
where
    F: FnMut(f64) -> f64,
{
    rescale(nodes, weights, a, b).map(|(x, weight)| weight * f(x)).sum()
}
