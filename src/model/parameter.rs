use std::sync::Arc;

use log::{debug, warn};
use nalgebra::DVector;
use ndarray::Array1;
use ninterp::prelude::{Interp1DOwned, Interpolator};

use crate::error::EngineError;
use crate::model::domain::{DomainId, DomainRegistry};
use crate::model::expression::{integrate, TimeExpression};
use crate::processing::series::validate_time_axis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Scalar(f64),
    /// One value per cell of the owning domain.
    Field(DVector<f64>),
}

impl ParameterValue {
    fn representative(&self) -> f64 {
        match self {
            ParameterValue::Scalar(v) => *v,
            ParameterValue::Field(f) if f.is_empty() => 0.0,
            ParameterValue::Field(f) => f.mean(),
        }
    }

    fn has_nan(&self) -> bool {
        match self {
            ParameterValue::Scalar(v) => v.is_nan(),
            ParameterValue::Field(f) => f.iter().any(|v| v.is_nan()),
        }
    }
}

/// Linear interpolation over sampled `(t, value)` pairs. Never extrapolates.
struct Table {
    interp: Interp1DOwned<f64, ninterp::strategy::Linear>,
    start: f64,
    end: f64,
}

impl Table {
    fn new(name: &str, times: Vec<f64>, values: Vec<f64>) -> Result<Self, EngineError> {
        validate_time_axis(&times)?;
        if times.len() != values.len() {
            return Err(EngineError::config(format!(
                "parameter '{}': {} times but {} values",
                name,
                times.len(),
                values.len()
            )));
        }
        if times.len() < 2 {
            return Err(EngineError::config(format!(
                "parameter '{}': tabulated data needs at least two samples",
                name
            )));
        }
        let start = times[0];
        let end = times[times.len() - 1];
        let interp = Interp1DOwned::new(
            Array1::from(times),
            Array1::from(values),
            ninterp::strategy::Linear,
            ninterp::interpolator::Extrapolate::Error,
        )
        .map_err(|e| EngineError::config(format!("parameter '{}': {}", name, e)))?;
        Ok(Self { interp, start, end })
    }

    fn eval(&self, name: &str, t: f64) -> Result<f64, EngineError> {
        let out_of_range = || EngineError::OutOfRange {
            parameter: name.to_string(),
            t,
            start: self.start,
            end: self.end,
        };
        if t < self.start || t > self.end {
            return Err(out_of_range());
        }
        self.interp.interpolate(&[t]).map_err(|_| out_of_range())
    }
}

/// Update rule of a parameter, fixed at construction.
enum ParameterKind {
    Constant,
    /// Expression sampled at the new time level.
    Sampled(Arc<dyn TimeExpression>),
    /// Step average through the closed-form antiderivative.
    ExactIntegral(Arc<dyn TimeExpression>),
    /// Step average through numerical quadrature, with a running total.
    QuadratureIntegral {
        expr: Arc<dyn TimeExpression>,
        cumulative: f64,
    },
    Tabulated(Table),
    /// Step average through a cumulative-integral table built from the samples.
    TabulatedIntegral { samples: Table, cumulative: Table },
    /// Field snapshots at sampled times on one domain.
    FieldSeries {
        domain: DomainId,
        times: Vec<f64>,
        snapshots: Vec<DVector<f64>>,
    },
}

/// A coefficient of the model, possibly time dependent.
pub struct Parameter {
    pub name: String,
    kind: ParameterKind,
    value: ParameterValue,
    history: Vec<(f64, f64)>,
}

impl Parameter {
    fn with_kind(name: impl Into<String>, kind: ParameterKind, value: ParameterValue) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            history: Vec::new(),
        }
    }

    pub fn constant(name: impl Into<String>, value: f64) -> Self {
        Self::with_kind(name, ParameterKind::Constant, ParameterValue::Scalar(value))
    }

    /// Expression evaluated at the end of each step.
    pub fn expression(name: impl Into<String>, expr: impl TimeExpression + 'static) -> Self {
        let expr: Arc<dyn TimeExpression> = Arc::new(expr);
        let v0 = expr.value(0.0);
        Self::with_kind(name, ParameterKind::Sampled(expr), ParameterValue::Scalar(v0))
    }

    /// Expression averaged exactly over each step. Uses the closed-form
    /// antiderivative when the expression has one, quadrature otherwise.
    pub fn pre_integrated(name: impl Into<String>, expr: impl TimeExpression + 'static) -> Self {
        let expr: Arc<dyn TimeExpression> = Arc::new(expr);
        let v0 = expr.value(0.0);
        let kind = if expr.has_antiderivative() {
            ParameterKind::ExactIntegral(expr)
        } else {
            ParameterKind::QuadratureIntegral {
                expr,
                cumulative: 0.0,
            }
        };
        Self::with_kind(name, kind, ParameterValue::Scalar(v0))
    }

    pub fn tabulated(
        name: impl Into<String>,
        times: Vec<f64>,
        values: Vec<f64>,
    ) -> Result<Self, EngineError> {
        let name = name.into();
        let v0 = values.first().copied().unwrap_or(0.0);
        let table = Table::new(&name, times, values)?;
        Ok(Self::with_kind(
            name,
            ParameterKind::Tabulated(table),
            ParameterValue::Scalar(v0),
        ))
    }

    pub fn tabulated_pre_integrated(
        name: impl Into<String>,
        times: Vec<f64>,
        values: Vec<f64>,
    ) -> Result<Self, EngineError> {
        let name = name.into();
        let v0 = values.first().copied().unwrap_or(0.0);
        let mut running = Vec::with_capacity(times.len());
        let mut acc = 0.0;
        for i in 0..times.len().min(values.len()) {
            if i > 0 {
                acc += 0.5 * (values[i] + values[i - 1]) * (times[i] - times[i - 1]);
            }
            running.push(acc);
        }
        let samples = Table::new(&name, times.clone(), values)?;
        let cumulative = Table::new(&name, times, running)?;
        Ok(Self::with_kind(
            name,
            ParameterKind::TabulatedIntegral {
                samples,
                cumulative,
            },
            ParameterValue::Scalar(v0),
        ))
    }

    pub fn field_series(
        name: impl Into<String>,
        domain: DomainId,
        times: Vec<f64>,
        snapshots: Vec<DVector<f64>>,
    ) -> Result<Self, EngineError> {
        let name = name.into();
        validate_time_axis(&times)?;
        if times.len() != snapshots.len() {
            return Err(EngineError::config(format!(
                "parameter '{}': {} times but {} snapshots",
                name,
                times.len(),
                snapshots.len()
            )));
        }
        let len = snapshots[0].len();
        if snapshots.iter().any(|s| s.len() != len) {
            return Err(EngineError::config(format!(
                "parameter '{}': snapshots differ in length",
                name
            )));
        }
        let v0 = ParameterValue::Field(snapshots[0].clone());
        Ok(Self::with_kind(
            name,
            ParameterKind::FieldSeries {
                domain,
                times,
                snapshots,
            },
            v0,
        ))
    }

    pub fn is_time_dependent(&self) -> bool {
        !matches!(self.kind, ParameterKind::Constant)
    }

    pub fn is_pre_integrated(&self) -> bool {
        matches!(
            self.kind,
            ParameterKind::ExactIntegral(_)
                | ParameterKind::QuadratureIntegral { .. }
                | ParameterKind::TabulatedIntegral { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ParameterKind::Constant => "constant",
            ParameterKind::Sampled(_) => "expression",
            ParameterKind::ExactIntegral(_) => "expression (exact integral)",
            ParameterKind::QuadratureIntegral { .. } => "expression (quadrature)",
            ParameterKind::Tabulated(_) => "tabulated",
            ParameterKind::TabulatedIntegral { .. } => "tabulated (cumulative)",
            ParameterKind::FieldSeries { .. } => "field series",
        }
    }

    /// Domain carrying a field-valued parameter.
    pub fn field_domain(&self) -> Option<DomainId> {
        match self.kind {
            ParameterKind::FieldSeries { domain, .. } => Some(domain),
            _ => None,
        }
    }

    pub fn value(&self) -> &ParameterValue {
        &self.value
    }

    /// Scalar value, or the mean for field parameters.
    pub fn scalar(&self) -> f64 {
        self.value.representative()
    }

    /// Value at a cell of the owning domain (the scalar for scalar kinds).
    #[inline]
    pub fn value_at(&self, cell: Option<usize>) -> f64 {
        match (&self.value, cell) {
            (ParameterValue::Scalar(v), _) => *v,
            (ParameterValue::Field(f), Some(c)) => f[c],
            (ParameterValue::Field(_), None) => self.value.representative(),
        }
    }

    /// Accepted `(t, value)` pairs; fields record their mean.
    pub fn history(&self) -> &[(f64, f64)] {
        &self.history
    }

    /// Set the instantaneous value at the start time.
    pub fn initialize(&mut self, t0: f64) -> Result<(), EngineError> {
        let value = match &mut self.kind {
            ParameterKind::Constant => self.value.clone(),
            ParameterKind::Sampled(expr) | ParameterKind::ExactIntegral(expr) => {
                ParameterValue::Scalar(expr.value(t0))
            }
            ParameterKind::QuadratureIntegral { expr, cumulative } => {
                *cumulative = 0.0;
                ParameterValue::Scalar(expr.value(t0))
            }
            ParameterKind::Tabulated(table) => ParameterValue::Scalar(table.eval(&self.name, t0)?),
            ParameterKind::TabulatedIntegral { samples, .. } => {
                ParameterValue::Scalar(samples.eval(&self.name, t0)?)
            }
            ParameterKind::FieldSeries {
                times, snapshots, ..
            } => ParameterValue::Field(field_at(&self.name, times, snapshots, t0)),
        };
        self.store(value, t0)?;
        self.history.clear();
        self.history.push((t0, self.value.representative()));
        Ok(())
    }

    /// Advance to the time level `t_now`.
    ///
    /// Pre-integrated kinds store the average rate over `[t_prev, t_now]`,
    /// i.e. the exact integral divided by `dt`.
    pub fn advance(&mut self, t_now: f64, t_prev: f64, dt: f64) -> Result<(), EngineError> {
        let value = match &mut self.kind {
            ParameterKind::Constant => return Ok(()),
            ParameterKind::Sampled(expr) => ParameterValue::Scalar(expr.value(t_now)),
            ParameterKind::ExactIntegral(expr) => {
                let (Some(f_now), Some(f_prev)) =
                    (expr.antiderivative(t_now), expr.antiderivative(t_prev))
                else {
                    return Err(EngineError::config(format!(
                        "parameter '{}' lost its antiderivative",
                        self.name
                    )));
                };
                ParameterValue::Scalar((f_now - f_prev) / dt)
            }
            ParameterKind::QuadratureIntegral { expr, cumulative } => {
                let increment = integrate(expr.as_ref(), t_prev, t_now);
                *cumulative += increment;
                ParameterValue::Scalar(increment / dt)
            }
            ParameterKind::Tabulated(table) => {
                ParameterValue::Scalar(table.eval(&self.name, t_now)?)
            }
            ParameterKind::TabulatedIntegral { cumulative, .. } => {
                let c_now = cumulative.eval(&self.name, t_now)?;
                let c_prev = cumulative.eval(&self.name, t_prev)?;
                ParameterValue::Scalar((c_now - c_prev) / dt)
            }
            ParameterKind::FieldSeries {
                times, snapshots, ..
            } => ParameterValue::Field(field_at(&self.name, times, snapshots, t_now)),
        };
        self.store(value, t_now)?;
        self.history.push((t_now, self.value.representative()));
        debug!("parameter '{}' = {:.6e} at t = {}", self.name, self.scalar(), t_now);
        Ok(())
    }

    fn store(&mut self, value: ParameterValue, t: f64) -> Result<(), EngineError> {
        if value.has_nan() {
            return Err(EngineError::Numerical {
                parameter: self.name.clone(),
                t,
            });
        }
        self.value = value;
        Ok(())
    }

    fn cumulative(&self) -> f64 {
        match self.kind {
            ParameterKind::QuadratureIntegral { cumulative, .. } => cumulative,
            _ => 0.0,
        }
    }

    fn set_cumulative(&mut self, value: f64) {
        if let ParameterKind::QuadratureIntegral { cumulative, .. } = &mut self.kind {
            *cumulative = value;
        }
    }
}

/// Snapshot at `t`, interpolating linearly between neighbouring samples and
/// clamping outside the sampled range.
fn field_at(name: &str, times: &[f64], snapshots: &[DVector<f64>], t: f64) -> DVector<f64> {
    let last = times.len() - 1;
    if t <= times[0] {
        if t < times[0] {
            warn!("parameter '{}': t = {} before first snapshot, clamping", name, t);
        }
        return snapshots[0].clone();
    }
    if t >= times[last] {
        if t > times[last] {
            warn!("parameter '{}': t = {} after last snapshot, clamping", name, t);
        }
        return snapshots[last].clone();
    }
    // times[i] <= t < times[i + 1]
    let i = times.partition_point(|&s| s <= t) - 1;
    if times[i] == t {
        return snapshots[i].clone();
    }
    let w = (t - times[i]) / (times[i + 1] - times[i]);
    &snapshots[i] * (1.0 - w) + &snapshots[i + 1] * w
}

/// Saved mutable state of every parameter, restored when a step is rejected.
#[derive(Debug, Clone)]
pub struct ParameterSnapshot {
    entries: Vec<(ParameterValue, f64, usize)>,
}

#[derive(Default)]
pub struct ParameterTable {
    params: Vec<Parameter>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, param: Parameter) -> ParamId {
        self.params.push(param);
        ParamId(self.params.len() - 1)
    }

    pub fn get(&self, id: ParamId) -> &Parameter {
        &self.params[id.0]
    }

    pub fn find(&self, name: &str) -> Option<ParamId> {
        self.params.iter().position(|p| p.name == name).map(ParamId)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Parameter)> {
        self.params.iter().enumerate().map(|(i, p)| (ParamId(i), p))
    }

    /// Scalar value of a parameter.
    pub fn value(&self, id: ParamId) -> f64 {
        self.params[id.0].scalar()
    }

    /// Check field parameters against the meshes they live on.
    pub fn validate(&self, registry: &DomainRegistry) -> Result<(), EngineError> {
        for p in &self.params {
            let (Some(domain), ParameterValue::Field(values)) = (p.field_domain(), &p.value) else {
                continue;
            };
            if domain.0 >= registry.len() {
                return Err(EngineError::config(format!(
                    "parameter '{}' refers to an undeclared domain",
                    p.name
                )));
            }
            let cells = registry.get(domain).mesh.num_cells();
            if values.len() != cells {
                return Err(EngineError::config(format!(
                    "parameter '{}' has {} values for {} cells of '{}'",
                    p.name,
                    values.len(),
                    cells,
                    registry.get(domain).name
                )));
            }
        }
        Ok(())
    }

    pub fn initialize(&mut self, t0: f64) -> Result<(), EngineError> {
        self.params.iter_mut().try_for_each(|p| p.initialize(t0))
    }

    pub fn advance_all(&mut self, t_now: f64, t_prev: f64, dt: f64) -> Result<(), EngineError> {
        self.params
            .iter_mut()
            .try_for_each(|p| p.advance(t_now, t_prev, dt))
    }

    pub fn snapshot(&self) -> ParameterSnapshot {
        ParameterSnapshot {
            entries: self
                .params
                .iter()
                .map(|p| (p.value.clone(), p.cumulative(), p.history.len()))
                .collect(),
        }
    }

    pub fn restore(&mut self, snapshot: ParameterSnapshot) {
        for (p, (value, cumulative, history_len)) in self.params.iter_mut().zip(snapshot.entries) {
            p.value = value;
            p.set_cumulative(cumulative);
            p.history.truncate(history_len);
        }
    }
}
