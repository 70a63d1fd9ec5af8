use nalgebra::DVector;

/// Collective operations the engine relies on.
///
/// Every worker must issue these calls in the same order. Implementations
/// for distributed runs wrap the message-passing layer; [`SerialComm`] is the
/// single-process implementation used by the binary and the tests.
pub trait Collective {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    fn all_reduce_sum(&self, local: f64) -> f64;
    fn all_reduce_min(&self, local: f64) -> f64;
    fn all_reduce_max(&self, local: f64) -> f64;

    /// Concatenate every worker's slice in rank order.
    fn gather(&self, local: &[f64]) -> Vec<f64>;

    fn barrier(&self) {}

    /// Global L2 norm of a distributed vector.
    fn norm2(&self, local: &DVector<f64>) -> f64 {
        self.all_reduce_sum(local.norm_squared()).sqrt()
    }

    /// Global max-norm of a distributed vector.
    fn norm_max(&self, local: &DVector<f64>) -> f64 {
        let local_max = if local.is_empty() { 0.0 } else { local.amax() };
        self.all_reduce_max(local_max)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;

impl Collective for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, local: f64) -> f64 {
        local
    }

    fn all_reduce_min(&self, local: f64) -> f64 {
        local
    }

    fn all_reduce_max(&self, local: f64) -> f64 {
        local
    }

    fn gather(&self, local: &[f64]) -> Vec<f64> {
        local.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_norms_match_local() {
        let comm = SerialComm;
        let v = DVector::from_vec(vec![3.0, -4.0]);
        assert_eq!(comm.norm2(&v), 5.0);
        assert_eq!(comm.norm_max(&v), 4.0);
        assert!(comm.is_root());
        assert_eq!(comm.gather(&[1.0, 2.0]), vec![1.0, 2.0]);
    }
}
