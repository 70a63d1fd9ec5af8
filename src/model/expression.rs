use std::fmt;
use std::sync::Arc;

/// A scalar function of time.
///
/// `antiderivative` returns `None` when no closed form is available, in
/// which case pre-integrated parameters fall back to numerical quadrature.
pub trait TimeExpression: Send + Sync {
    fn value(&self, t: f64) -> f64;

    fn antiderivative(&self, _t: f64) -> Option<f64> {
        None
    }

    fn has_antiderivative(&self) -> bool {
        self.antiderivative(0.0).is_some()
    }
}

type ScalarFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Closure-backed expression with an optional closed-form antiderivative.
#[derive(Clone)]
pub struct FnExpression {
    label: String,
    f: ScalarFn,
    integral: Option<ScalarFn>,
}

impl FnExpression {
    pub fn new(label: impl Into<String>, f: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            label: label.into(),
            f: Arc::new(f),
            integral: None,
        }
    }

    pub fn with_antiderivative(
        mut self,
        integral: impl Fn(f64) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.integral = Some(Arc::new(integral));
        self
    }

    pub fn constant(c: f64) -> Self {
        Self::new(format!("{}", c), move |_| c).with_antiderivative(move |t| c * t)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for FnExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnExpression")
            .field("label", &self.label)
            .field("closed_form_integral", &self.integral.is_some())
            .finish()
    }
}

impl TimeExpression for FnExpression {
    fn value(&self, t: f64) -> f64 {
        (self.f)(t)
    }

    fn antiderivative(&self, t: f64) -> Option<f64> {
        self.integral.as_ref().map(|g| g(t))
    }
}

const QUADRATURE_TOL: f64 = 1e-12;
const QUADRATURE_DEPTH: u32 = 40;

/// Integrate `expr` over `[a, b]` with adaptive Simpson quadrature.
pub fn integrate(expr: &dyn TimeExpression, a: f64, b: f64) -> f64 {
    if a == b {
        return 0.0;
    }
    let fa = expr.value(a);
    let fb = expr.value(b);
    let m = 0.5 * (a + b);
    let fm = expr.value(m);
    let whole = simpson(a, b, fa, fm, fb);
    let scale = whole.abs().max(1.0);
    adaptive_simpson(expr, a, b, fa, fm, fb, whole, QUADRATURE_TOL * scale, QUADRATURE_DEPTH)
}

#[inline]
fn simpson(a: f64, b: f64, fa: f64, fm: f64, fb: f64) -> f64 {
    (b - a) / 6.0 * (fa + 4.0 * fm + fb)
}

#[allow(clippy::too_many_arguments)]
fn adaptive_simpson(
    expr: &dyn TimeExpression,
    a: f64,
    b: f64,
    fa: f64,
    fm: f64,
    fb: f64,
    whole: f64,
    tol: f64,
    depth: u32,
) -> f64 {
    let m = 0.5 * (a + b);
    let lm = 0.5 * (a + m);
    let rm = 0.5 * (m + b);
    let flm = expr.value(lm);
    let frm = expr.value(rm);
    let left = simpson(a, m, fa, flm, fm);
    let right = simpson(m, b, fm, frm, fb);
    let delta = left + right - whole;

    if depth == 0 || delta.abs() <= 15.0 * tol || !delta.is_finite() {
        return left + right + delta / 15.0;
    }
    adaptive_simpson(expr, a, m, fa, flm, fm, left, 0.5 * tol, depth - 1)
        + adaptive_simpson(expr, m, b, fm, frm, fb, right, 0.5 * tol, depth - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn quadrature_matches_closed_form() {
        let expr = FnExpression::new("sin", |t: f64| (3.0 * t).sin());
        let exact = (1.0 - (3.0f64 * 2.0).cos()) / 3.0;
        assert_relative_eq!(integrate(&expr, 0.0, 2.0), exact, epsilon = 1e-10);
    }

    #[test]
    fn constant_has_antiderivative() {
        let c = FnExpression::constant(2.5);
        assert!(c.has_antiderivative());
        assert_eq!(c.antiderivative(4.0), Some(10.0));
        assert!(!FnExpression::new("t", |t| t).has_antiderivative());
    }
}
