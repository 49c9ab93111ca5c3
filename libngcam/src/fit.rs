use serde::{Deserialize, Serialize};

use super::constants::{FIT_DIFF_STEP, FIT_MAX_ITERATIONS, FIT_TOLERANCE};
use super::error::FitError;

const N_PARAMS: usize = 3;
const INITIAL_DAMPING: f64 = 1e-3;
const MAX_DAMPING: f64 = 1e16;
const PIVOT_EPSILON: f64 = 1e-300;

/// Parameters of `c0 * exp(-((x - c1) / c2)^2)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GaussianParams {
    pub amplitude: f64,
    pub centre: f64,
    pub width: f64,
}

impl GaussianParams {
    pub fn new(amplitude: f64, centre: f64, width: f64) -> Self {
        Self {
            amplitude,
            centre,
            width,
        }
    }

    pub fn eval(&self, x: f64) -> f64 {
        let u = (x - self.centre) / self.width;
        self.amplitude * (-u * u).exp()
    }

    /// Full width at half maximum of this curve
    pub fn fwhm(&self) -> f64 {
        2.0 * std::f64::consts::LN_2.sqrt() * self.width.abs()
    }

    fn to_array(self) -> [f64; N_PARAMS] {
        [self.amplitude, self.centre, self.width]
    }

    fn from_array(p: [f64; N_PARAMS]) -> Self {
        Self::new(p[0], p[1], p[2])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianFit {
    pub params: GaussianParams,
    pub r2: f64,
    pub iterations: usize,
}

/// Anything able to fit a single Gaussian to (x, y) samples
pub trait GaussianFitter {
    fn fit(&self, x: &[f64], y: &[f64], guess: GaussianParams) -> Result<GaussianFit, FitError>;
}

/// Coefficient of determination of `params` over the samples. Zero when y is constant.
pub fn r_squared(x: &[f64], y: &[f64], params: &GaussianParams) -> f64 {
    if y.is_empty() {
        return 0.0;
    }
    let mean = y.iter().sum::<f64>() / y.len() as f64;
    let ss_tot: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();
    if ss_tot == 0.0 {
        return 0.0;
    }
    let ss_res: f64 = x
        .iter()
        .zip(y)
        .map(|(xi, yi)| (yi - params.eval(*xi)).powi(2))
        .sum();
    1.0 - ss_res / ss_tot
}

/// Damped Gauss-Newton least squares with a forward-difference Jacobian
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    pub diff_step: f64,
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            diff_step: FIT_DIFF_STEP,
            tolerance: FIT_TOLERANCE,
            max_iterations: FIT_MAX_ITERATIONS,
        }
    }
}

impl LevenbergMarquardt {
    fn cost(x: &[f64], y: &[f64], p: [f64; N_PARAMS]) -> f64 {
        let params = GaussianParams::from_array(p);
        x.iter()
            .zip(y)
            .map(|(xi, yi)| (yi - params.eval(*xi)).powi(2))
            .sum()
    }

    /// Normal equations J^T J and J^T r at p
    fn normal_equations(
        &self,
        x: &[f64],
        y: &[f64],
        p: [f64; N_PARAMS],
    ) -> ([[f64; N_PARAMS]; N_PARAMS], [f64; N_PARAMS]) {
        let base = GaussianParams::from_array(p);
        let mut steps = [0.0; N_PARAMS];
        let mut shifted = [base; N_PARAMS];
        for j in 0..N_PARAMS {
            let sign = if p[j] < 0.0 { -1.0 } else { 1.0 };
            steps[j] = self.diff_step * sign * p[j].abs().max(1.0);
            let mut q = p;
            q[j] += steps[j];
            shifted[j] = GaussianParams::from_array(q);
        }

        let mut jtj = [[0.0; N_PARAMS]; N_PARAMS];
        let mut jtr = [0.0; N_PARAMS];
        for (xi, yi) in x.iter().zip(y) {
            let f0 = base.eval(*xi);
            let residual = yi - f0;
            let mut row = [0.0; N_PARAMS];
            for j in 0..N_PARAMS {
                row[j] = (shifted[j].eval(*xi) - f0) / steps[j];
            }
            for a in 0..N_PARAMS {
                jtr[a] += row[a] * residual;
                for b in 0..N_PARAMS {
                    jtj[a][b] += row[a] * row[b];
                }
            }
        }
        (jtj, jtr)
    }
}

/// Solve a small dense system by elimination with partial pivoting
fn solve(mut a: [[f64; N_PARAMS]; N_PARAMS], mut b: [f64; N_PARAMS]) -> Option<[f64; N_PARAMS]> {
    for col in 0..N_PARAMS {
        let pivot = (col..N_PARAMS).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < PIVOT_EPSILON || !a[pivot][col].is_finite() {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in (col + 1)..N_PARAMS {
            let factor = a[row][col] / a[col][col];
            for k in col..N_PARAMS {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut out = [0.0; N_PARAMS];
    for row in (0..N_PARAMS).rev() {
        let tail: f64 = ((row + 1)..N_PARAMS).map(|k| a[row][k] * out[k]).sum();
        out[row] = (b[row] - tail) / a[row][row];
    }
    Some(out)
}

impl GaussianFitter for LevenbergMarquardt {
    fn fit(&self, x: &[f64], y: &[f64], guess: GaussianParams) -> Result<GaussianFit, FitError> {
        let n = x.len().min(y.len());
        if n < N_PARAMS {
            return Err(FitError::TooFewPoints {
                need: N_PARAMS,
                got: n,
            });
        }
        let (x, y) = (&x[..n], &y[..n]);

        let mut p = guess.to_array();
        let mut cost = Self::cost(x, y, p);
        if !cost.is_finite() {
            return Err(FitError::NonFinite(0));
        }
        let mut damping = INITIAL_DAMPING;

        for iteration in 1..=self.max_iterations {
            let (jtj, jtr) = self.normal_equations(x, y, p);
            if jtj.iter().flatten().all(|v| *v == 0.0) {
                return Err(FitError::Singular(iteration));
            }

            let mut improved = false;
            while damping <= MAX_DAMPING {
                let mut damped = jtj;
                for j in 0..N_PARAMS {
                    let diag = if jtj[j][j] > 0.0 { jtj[j][j] } else { 1.0 };
                    damped[j][j] += damping * diag;
                }
                let delta = match solve(damped, jtr) {
                    Some(delta) => delta,
                    None => {
                        damping *= 10.0;
                        continue;
                    }
                };
                let mut trial = p;
                for j in 0..N_PARAMS {
                    trial[j] += delta[j];
                }
                let trial_cost = Self::cost(x, y, trial);
                if trial_cost.is_finite() && trial_cost <= cost {
                    let step_small = (0..N_PARAMS)
                        .all(|j| delta[j].abs() <= self.tolerance * (p[j].abs() + self.tolerance));
                    let cost_small = (cost - trial_cost) <= self.tolerance * cost;
                    p = trial;
                    cost = trial_cost;
                    damping = (damping / 10.0).max(1e-12);
                    improved = true;
                    if step_small || cost_small {
                        let params = GaussianParams::from_array(p);
                        return Ok(GaussianFit {
                            params,
                            r2: r_squared(x, y, &params),
                            iterations: iteration,
                        });
                    }
                    break;
                }
                damping *= 10.0;
            }

            // no damping level lowers the cost: we are sitting in the minimum
            if !improved {
                let params = GaussianParams::from_array(p);
                if !params.width.is_finite() || params.width == 0.0 {
                    return Err(FitError::NonFinite(iteration));
                }
                return Ok(GaussianFit {
                    params,
                    r2: r_squared(x, y, &params),
                    iterations: iteration,
                });
            }
        }
        Err(FitError::NoConvergence(self.max_iterations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(params: &GaussianParams, n: usize, step: f64) -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..n).map(|i| i as f64 * step).collect();
        let y = x.iter().map(|v| params.eval(*v)).collect();
        (x, y)
    }

    #[test]
    fn test_recovers_exact_gaussian() {
        let truth = GaussianParams::new(80.0, 0.3, 0.01);
        let (x, y) = sample(&truth, 301, 0.002);
        let fit = LevenbergMarquardt::default()
            .fit(&x, &y, GaussianParams::new(80.0, 0.3, 0.001))
            .unwrap();
        assert!((fit.params.amplitude - 80.0).abs() < 1e-3);
        assert!((fit.params.centre - 0.3).abs() < 1e-5);
        assert!((fit.params.width.abs() - 0.01).abs() < 1e-5);
        assert!(fit.r2 > 0.9999);
    }

    #[test]
    fn test_offset_seed() {
        let truth = GaussianParams::new(40.0, 0.52, 0.016);
        let (x, y) = sample(&truth, 501, 0.002);
        let fit = LevenbergMarquardt::default()
            .fit(&x, &y, GaussianParams::new(38.0, 0.518, 0.001))
            .unwrap();
        assert!((fit.params.centre - 0.52).abs() < 1e-4);
        assert!((fit.params.fwhm() - truth.fwhm()).abs() < 1e-4);
    }

    #[test]
    fn test_too_few_points() {
        let fit = LevenbergMarquardt::default().fit(
            &[0.0, 1.0],
            &[1.0, 2.0],
            GaussianParams::new(1.0, 0.0, 1.0),
        );
        assert_eq!(fit, Err(FitError::TooFewPoints { need: 3, got: 2 }));
    }

    #[test]
    fn test_r_squared() {
        let params = GaussianParams::new(10.0, 0.5, 0.1);
        let (x, y) = sample(&params, 100, 0.01);
        assert!((r_squared(&x, &y, &params) - 1.0).abs() < 1e-12);
        assert_eq!(r_squared(&x, &vec![3.0; 100], &params), 0.0);
        assert_eq!(r_squared(&[], &[], &params), 0.0);
    }

    #[test]
    fn test_solve() {
        let a = [[2.0, 1.0, 0.0], [1.0, 3.0, 1.0], [0.0, 1.0, 4.0]];
        let x = solve(a, [3.0, 5.0, 5.0]).unwrap();
        for (got, want) in x.iter().zip([1.0, 1.0, 1.0]) {
            assert!((got - want).abs() < 1e-12);
        }
        assert!(solve([[0.0; 3]; 3], [1.0; 3]).is_none());
    }
}
