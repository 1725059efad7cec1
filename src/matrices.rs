use crate::model::ModelSlot;

/// Fill one node's transition-matrix row from the cached eigenvector
/// product: per category, `P(t)_ij = sum_k C[i,j,k] * exp(lambda_k * t * rate)`.
/// Rows are `state_count + 1` wide; the trailing entry of each row is the
/// 1.0 sentinel selected by ambiguous tip states.
pub(crate) fn build_matrices(
    model: &ModelSlot,
    branch_length: f64,
    state_count: usize,
    expt: &mut [f64],
    out: &mut [f64],
) {
    let mut n = 0;
    for &rate in &model.category_rates {
        for (i, e) in expt.iter_mut().enumerate() {
            *e = (model.eigenvalues[i] * branch_length * rate).exp();
        }
        let mut m = 0;
        for _i in 0..state_count {
            for _j in 0..state_count {
                let mut sum = 0.0;
                for e in expt.iter() {
                    sum += model.cmatrix[m] * e;
                    m += 1;
                }
                out[n] = sum;
                n += 1;
            }
            out[n] = 1.0;
            n += 1;
        }
    }
}
