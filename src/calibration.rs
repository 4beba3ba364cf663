//! Beam position calibration.
//!
//! [`CalibrationEngine::fit`] turns an ordered position→reading series into a
//! [`CalibrationResult`]. The physical mapping is assumed monotonic, so the
//! engine rejects any series where either the positions or the readings turn
//! around. The result interpolates piecewise-linearly between measured points,
//! extrapolates with the end segments, and also carries a least-squares line.
//!
//! [`CalibrationEngine::fit_spectral`] maps SLM grating columns to the
//! wavelength they diffract onto the detector with a least-squares polynomial
//! ([`SpectralCalibration`]).

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Minimum number of points any fit needs.
pub const MIN_FIT_POINTS: usize = 2;

/// One measured calibration point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Beam position (SLM row).
    pub position: f64,
    /// Physical reading at that position.
    pub reading: f64,
}

/// Direction of a strictly monotonic series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Strictly increasing.
    Increasing,
    /// Strictly decreasing.
    Decreasing,
}

/// Ordinary least-squares line `reading = slope * position + intercept`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    /// Slope.
    pub slope: f64,
    /// Intercept.
    pub intercept: f64,
    /// Coefficient of determination.
    pub r_squared: f64,
}

/// Immutable position→unit mapping produced by one calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// Points sorted by ascending position.
    pub points: Vec<CalibrationPoint>,
    /// How readings change with increasing position.
    pub direction: Direction,
    /// Least-squares line through all points.
    pub linear: LinearFit,
    /// Unit of the readings.
    pub unit: String,
    /// When the fit was made.
    pub created_at: DateTime<Utc>,
}

impl CalibrationResult {
    /// Convert a beam position into the physical unit.
    pub fn to_unit(&self, position: f64) -> f64 {
        interpolate(&self.points, position, |p| p.position, |p| p.reading)
    }

    /// Convert a physical value back into a beam position.
    pub fn to_position(&self, value: f64) -> f64 {
        let mut by_reading = self.points.clone();
        if self.direction == Direction::Decreasing {
            by_reading.reverse();
        }
        interpolate(&by_reading, value, |p| p.reading, |p| p.position)
    }

    /// Convert a whole axis.
    pub fn convert_axis(&self, positions: &[f64]) -> Vec<f64> {
        positions.iter().map(|p| self.to_unit(*p)).collect()
    }

    /// Measured position range.
    pub fn position_range(&self) -> (f64, f64) {
        let first = self.points.first().map_or(0.0, |p| p.position);
        let last = self.points.last().map_or(0.0, |p| p.position);
        (first, last)
    }
}

/// Least-squares polynomial in a column scaled from `domain` onto [-1, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolynomialFit {
    /// Coefficients in ascending powers of the scaled column.
    pub coefficients: Vec<f64>,
    /// Column range mapped onto [-1, 1].
    pub domain: (f64, f64),
    /// Coefficient of determination.
    pub r_squared: f64,
}

impl PolynomialFit {
    /// Polynomial degree.
    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    /// Evaluate at `x`.
    pub fn eval(&self, x: f64) -> f64 {
        let t = scale_to_window(x, self.domain);
        self.coefficients.iter().rev().fold(0.0, |acc, c| acc * t + c)
    }
}

fn scale_to_window(x: f64, (lo, hi): (f64, f64)) -> f64 {
    if hi > lo {
        (2.0 * x - (lo + hi)) / (hi - lo)
    } else {
        0.0
    }
}

/// Column→wavelength mapping from one spectral beam calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralCalibration {
    /// Columns whose peak fell inside the bounds, in scan order.
    pub columns: Vec<f64>,
    /// Peak wavelength measured at each kept column (nm).
    pub wavelengths_nm: Vec<f64>,
    /// Wavelength window peaks had to fall in.
    pub bounds_nm: (f64, f64),
    /// Fitted polynomial.
    pub fit: PolynomialFit,
    /// When the fit was made.
    pub created_at: DateTime<Utc>,
}

impl SpectralCalibration {
    /// Wavelength diffracted by a grating at `column`.
    pub fn wavelength_at(&self, column: f64) -> f64 {
        self.fit.eval(column)
    }

    /// Convert a column axis to wavelengths.
    pub fn convert_axis(&self, columns: &[f64]) -> Vec<f64> {
        columns.iter().map(|c| self.wavelength_at(*c)).collect()
    }
}

fn interpolate<X, Y>(points: &[CalibrationPoint], x: f64, key: X, value: Y) -> f64
where
    X: Fn(&CalibrationPoint) -> f64,
    Y: Fn(&CalibrationPoint) -> f64,
{
    match points {
        [] => f64::NAN,
        [only] => value(only),
        _ => {
            // index of the segment containing x, clamped to the end segments
            let upper = points
                .iter()
                .position(|p| key(p) >= x)
                .unwrap_or(points.len() - 1)
                .clamp(1, points.len() - 1);
            let (a, b) = (&points[upper - 1], &points[upper]);
            let t = (x - key(a)) / (key(b) - key(a));
            value(a) + t * (value(b) - value(a))
        }
    }
}

/// Fits calibration series.
#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    min_points: usize,
    unit: String,
}

impl Default for CalibrationEngine {
    fn default() -> Self {
        Self::new(MIN_FIT_POINTS, "counts")
    }
}

impl CalibrationEngine {
    /// Engine requiring at least `min_points` (never fewer than two).
    pub fn new(min_points: usize, unit: impl Into<String>) -> Self {
        Self {
            min_points: min_points.max(MIN_FIT_POINTS),
            unit: unit.into(),
        }
    }

    /// Minimum accepted point count.
    pub fn min_points(&self) -> usize {
        self.min_points
    }

    /// Fit positions against readings.
    ///
    /// # Errors
    ///
    /// - `PreconditionFailed` when the slices differ in length
    /// - `InsufficientPoints` below the minimum count
    /// - `NonMonotonicInput` at the first index where positions or readings stop
    ///   being strictly monotonic, or hold a non-finite value
    pub fn fit(&self, positions: &[f64], readings: &[f64]) -> AppResult<CalibrationResult> {
        if positions.len() != readings.len() {
            return Err(DaqError::PreconditionFailed(format!(
                "{} positions but {} readings",
                positions.len(),
                readings.len()
            )));
        }
        if positions.len() < self.min_points {
            return Err(DaqError::InsufficientPoints {
                got: positions.len(),
                needed: self.min_points,
            });
        }
        if let Some(index) = positions
            .iter()
            .zip(readings)
            .position(|(p, r)| !p.is_finite() || !r.is_finite())
        {
            return Err(DaqError::NonMonotonicInput { index });
        }

        let position_dir = monotonic_direction(positions)?;
        let reading_dir = monotonic_direction(readings)?;

        let mut points: Vec<CalibrationPoint> = positions
            .iter()
            .zip(readings)
            .map(|(&position, &reading)| CalibrationPoint { position, reading })
            .collect();
        if position_dir == Direction::Decreasing {
            points.reverse();
        }
        let direction = if position_dir == reading_dir {
            Direction::Increasing
        } else {
            Direction::Decreasing
        };

        let linear = linear_fit(&points);
        tracing::debug!(
            points = points.len(),
            slope = linear.slope,
            r_squared = linear.r_squared,
            "Calibration fitted"
        );
        Ok(CalibrationResult {
            points,
            direction,
            linear,
            unit: self.unit.clone(),
            created_at: Utc::now(),
        })
    }

    /// Fit a polynomial of `degree` through column→peak-wavelength pairs.
    ///
    /// Pairs whose wavelength is not finite or lies outside `bounds_nm` are
    /// dropped first; they are detector noise, not the diffracted line.
    ///
    /// # Errors
    ///
    /// - `PreconditionFailed` for mismatched lengths, a zero degree or
    ///   inverted bounds
    /// - `NonMonotonicInput` when the kept columns are not strictly monotonic
    /// - `InsufficientPoints` when fewer than `degree + 1` (and the engine
    ///   minimum) pairs remain
    pub fn fit_spectral(
        &self,
        columns: &[f64],
        wavelengths_nm: &[f64],
        bounds_nm: (f64, f64),
        degree: usize,
    ) -> AppResult<SpectralCalibration> {
        if columns.len() != wavelengths_nm.len() {
            return Err(DaqError::PreconditionFailed(format!(
                "{} columns but {} wavelengths",
                columns.len(),
                wavelengths_nm.len()
            )));
        }
        if degree == 0 {
            return Err(DaqError::PreconditionFailed(
                "polynomial degree must be at least 1".into(),
            ));
        }
        let (low, high) = bounds_nm;
        if !(low.is_finite() && high.is_finite() && low < high) {
            return Err(DaqError::PreconditionFailed(format!(
                "wavelength bounds {low}..{high} are empty"
            )));
        }

        let (kept_columns, kept_wavelengths): (Vec<f64>, Vec<f64>) = columns
            .iter()
            .zip(wavelengths_nm)
            .filter(|(c, w)| c.is_finite() && w.is_finite() && (low..=high).contains(*w))
            .map(|(c, w)| (*c, *w))
            .unzip();

        let needed = self.min_points.max(degree + 1);
        if kept_columns.len() < needed {
            return Err(DaqError::InsufficientPoints {
                got: kept_columns.len(),
                needed,
            });
        }
        monotonic_direction(&kept_columns)?;

        let fit = polynomial_fit(&kept_columns, &kept_wavelengths, degree).ok_or_else(|| {
            DaqError::PreconditionFailed("polynomial fit is singular".into())
        })?;
        tracing::debug!(
            points = kept_columns.len(),
            dropped = columns.len() - kept_columns.len(),
            degree,
            r_squared = fit.r_squared,
            "Spectral calibration fitted"
        );
        Ok(SpectralCalibration {
            columns: kept_columns,
            wavelengths_nm: kept_wavelengths,
            bounds_nm,
            fit,
            created_at: Utc::now(),
        })
    }

    /// Fit a list of points in acquisition order.
    pub fn fit_points(&self, points: &[CalibrationPoint]) -> AppResult<CalibrationResult> {
        let positions: Vec<f64> = points.iter().map(|p| p.position).collect();
        let readings: Vec<f64> = points.iter().map(|p| p.reading).collect();
        self.fit(&positions, &readings)
    }
}

/// Direction of a strictly monotonic series, or the first offending index.
fn monotonic_direction(values: &[f64]) -> AppResult<Direction> {
    let mut direction = None;
    for (i, pair) in values.windows(2).enumerate() {
        let step = match pair[1].partial_cmp(&pair[0]) {
            Some(Ordering::Greater) => Direction::Increasing,
            Some(Ordering::Less) => Direction::Decreasing,
            _ => return Err(DaqError::NonMonotonicInput { index: i + 1 }),
        };
        match direction {
            None => direction = Some(step),
            Some(d) if d == step => {}
            Some(_) => return Err(DaqError::NonMonotonicInput { index: i + 1 }),
        }
    }
    direction.ok_or(DaqError::InsufficientPoints {
        got: values.len(),
        needed: MIN_FIT_POINTS,
    })
}

fn linear_fit(points: &[CalibrationPoint]) -> LinearFit {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.position).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.reading).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.position - mean_x).powi(2)).sum();
    let sxy: f64 = points
        .iter()
        .map(|p| (p.position - mean_x) * (p.reading - mean_y))
        .sum();
    let syy: f64 = points.iter().map(|p| (p.reading - mean_y).powi(2)).sum();

    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    let intercept = mean_y - slope * mean_x;
    let r_squared = if sxx > 0.0 && syy > 0.0 {
        (sxy * sxy) / (sxx * syy)
    } else {
        1.0
    };
    LinearFit {
        slope,
        intercept,
        r_squared,
    }
}

/// Normal equations solved by Gaussian elimination with partial pivoting.
fn polynomial_fit(xs: &[f64], ys: &[f64], degree: usize) -> Option<PolynomialFit> {
    let lo = xs.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let domain = (lo, hi);
    let n = degree + 1;

    // augmented n x (n + 1) system
    let mut system = vec![vec![0.0; n + 1]; n];
    for (&x, &y) in xs.iter().zip(ys) {
        let t = scale_to_window(x, domain);
        let powers: Vec<f64> = (0..=2 * degree)
            .scan(1.0, |p, _| {
                let current = *p;
                *p *= t;
                Some(current)
            })
            .collect();
        for (row, equation) in system.iter_mut().enumerate() {
            for (col, cell) in equation.iter_mut().take(n).enumerate() {
                *cell += powers[row + col];
            }
            equation[n] += y * powers[row];
        }
    }

    for pivot in 0..n {
        let best = (pivot..n)
            .max_by(|a, b| system[*a][pivot].abs().total_cmp(&system[*b][pivot].abs()))?;
        if system[best][pivot].abs() < 1e-12 {
            return None;
        }
        system.swap(pivot, best);
        for row in pivot + 1..n {
            let factor = system[row][pivot] / system[pivot][pivot];
            for col in pivot..=n {
                system[row][col] -= factor * system[pivot][col];
            }
        }
    }
    let mut coefficients = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|col| system[row][col] * coefficients[col]).sum();
        coefficients[row] = (system[row][n] - tail) / system[row][row];
    }

    let mut fit = PolynomialFit {
        coefficients,
        domain,
        r_squared: 1.0,
    };
    let mean = ys.iter().sum::<f64>() / ys.len() as f64;
    let total: f64 = ys.iter().map(|y| (y - mean).powi(2)).sum();
    let residual: f64 = xs.iter().zip(ys).map(|(x, y)| (y - fit.eval(*x)).powi(2)).sum();
    if total > 0.0 {
        fit.r_squared = 1.0 - residual / total;
    }
    Some(fit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increasing_series_fits() {
        let engine = CalibrationEngine::default();
        let result = engine.fit(&[0.0, 1.0, 2.0], &[1.0, 3.0, 5.0]).unwrap();
        assert_eq!(result.direction, Direction::Increasing);
        assert!((result.linear.slope - 2.0).abs() < 1e-12);
        assert!((result.linear.intercept - 1.0).abs() < 1e-12);
        assert!((result.linear.r_squared - 1.0).abs() < 1e-12);
    }

    #[test]
    fn non_monotonic_readings_are_rejected() {
        let engine = CalibrationEngine::default();
        let err = engine.fit(&[0.0, 1.0, 2.0], &[1.0, 5.0, 3.0]).unwrap_err();
        assert_eq!(err, DaqError::NonMonotonicInput { index: 2 });
    }

    #[test]
    fn non_monotonic_positions_are_rejected() {
        let engine = CalibrationEngine::default();
        let err = engine
            .fit(&[0.0, 2.0, 1.0, 3.0], &[1.0, 2.0, 3.0, 4.0])
            .unwrap_err();
        assert_eq!(err, DaqError::NonMonotonicInput { index: 2 });

        let err = engine.fit(&[0.0, 0.0], &[1.0, 2.0]).unwrap_err();
        assert_eq!(err, DaqError::NonMonotonicInput { index: 1 });
    }

    #[test]
    fn too_few_points_is_insufficient() {
        let engine = CalibrationEngine::new(3, "nm");
        let err = engine.fit(&[0.0, 1.0], &[1.0, 2.0]).unwrap_err();
        assert_eq!(err, DaqError::InsufficientPoints { got: 2, needed: 3 });
    }

    #[test]
    fn nan_reading_is_rejected_at_its_index() {
        let engine = CalibrationEngine::default();
        let err = engine.fit(&[0.0, 1.0, 2.0], &[1.0, f64::NAN, 3.0]).unwrap_err();
        assert_eq!(err, DaqError::NonMonotonicInput { index: 1 });
    }

    #[test]
    fn interpolates_and_inverts_decreasing_mapping() {
        let engine = CalibrationEngine::new(2, "nm");
        // positions descending, readings ascending: decreasing mapping
        let result = engine
            .fit(&[20.0, 10.0, 0.0], &[500.0, 600.0, 800.0])
            .unwrap();
        assert_eq!(result.direction, Direction::Decreasing);
        assert_eq!(result.position_range(), (0.0, 20.0));

        assert!((result.to_unit(5.0) - 700.0).abs() < 1e-9);
        assert!((result.to_unit(15.0) - 550.0).abs() < 1e-9);
        // extrapolation past the last segment
        assert!((result.to_unit(30.0) - 400.0).abs() < 1e-9);

        assert!((result.to_position(700.0) - 5.0).abs() < 1e-9);
        assert!((result.to_position(550.0) - 15.0).abs() < 1e-9);
        assert_eq!(result.convert_axis(&[0.0, 10.0]), vec![800.0, 600.0]);
    }

    #[test]
    fn quadratic_dispersion_is_recovered() {
        let engine = CalibrationEngine::default();
        let columns: Vec<f64> = (0..10).map(|i| f64::from(i) * 100.0).collect();
        let wavelengths: Vec<f64> = columns
            .iter()
            .map(|c| 500.0 + 0.12 * c - 2e-5 * c * c)
            .collect();
        let cal = engine
            .fit_spectral(&columns, &wavelengths, (400.0, 800.0), 2)
            .unwrap();

        assert_eq!(cal.fit.degree(), 2);
        assert_eq!(cal.fit.domain, (0.0, 900.0));
        assert!((cal.fit.r_squared - 1.0).abs() < 1e-9);
        assert!((cal.wavelength_at(450.0) - (500.0 + 54.0 - 4.05)).abs() < 1e-6);
        // extrapolates past the scanned columns
        assert!((cal.wavelength_at(1000.0) - 600.0).abs() < 1e-6);
    }

    #[test]
    fn peaks_outside_bounds_are_dropped_before_fitting() {
        let engine = CalibrationEngine::default();
        let columns = [0.0, 10.0, 20.0, 30.0, 40.0];
        let wavelengths = [600.0, 1.0, 602.0, f64::NAN, 604.0];
        let cal = engine
            .fit_spectral(&columns, &wavelengths, (550.0, 650.0), 1)
            .unwrap();
        assert_eq!(cal.columns, vec![0.0, 20.0, 40.0]);
        assert_eq!(cal.convert_axis(&[10.0]).len(), 1);
        assert!((cal.wavelength_at(10.0) - 601.0).abs() < 1e-9);
    }

    #[test]
    fn spectral_fit_needs_degree_plus_one_points() {
        let engine = CalibrationEngine::default();
        let err = engine
            .fit_spectral(
                &[0.0, 1.0, 2.0, 3.0],
                &[600.0, 601.0, 900.0, 603.0],
                (550.0, 650.0),
                3,
            )
            .unwrap_err();
        assert_eq!(err, DaqError::InsufficientPoints { got: 3, needed: 4 });

        let err = engine
            .fit_spectral(&[0.0, 2.0, 1.0], &[600.0, 601.0, 602.0], (550.0, 650.0), 1)
            .unwrap_err();
        assert_eq!(err, DaqError::NonMonotonicInput { index: 2 });

        let err = engine
            .fit_spectral(&[0.0, 1.0], &[600.0, 601.0], (650.0, 550.0), 1)
            .unwrap_err();
        assert!(matches!(err, DaqError::PreconditionFailed(_)));
    }
}
