//! The three pruning kernels. Each computes a parent's partial likelihood
//! vector per rate category over the parent's distinct compressed patterns,
//! selecting child contributions either by observed state (a transition
//! matrix column, where index `state_count` is the all-ones sentinel) or by
//! matrix-vector product against the child's partials.
//!
//! Matrix rows are `state_count + 1` wide; partial rows are category-major
//! with a fixed `pattern_count * state_count` category stride, of which the
//! first `distinct * state_count` entries are live.

pub(crate) struct KernelDims {
    pub state_count: usize,
    pub category_count: usize,
    pub matrix_size: usize,
    pub partials_size: usize,
}

/// Both children carry observed states.
pub(crate) fn states_states(
    dims: &KernelDims,
    matrices1: &[f64],
    matrices2: &[f64],
    states1: &[u32],
    states2: &[u32],
    distinct: usize,
    out: &mut [f64],
) {
    for l in 0..dims.category_count {
        let mut v = l * dims.partials_size;
        for k in 0..distinct {
            let state1 = states1[k] as usize;
            let state2 = states2[k] as usize;
            let mut w = l * dims.matrix_size;
            for _i in 0..dims.state_count {
                out[v] = matrices1[w + state1] * matrices2[w + state2];
                v += 1;
                w += dims.state_count + 1;
            }
        }
    }
}

/// Child 1 carries observed states, child 2 carries partials.
pub(crate) fn states_partials(
    dims: &KernelDims,
    matrices1: &[f64],
    states1: &[u32],
    matrices2: &[f64],
    partials2: &[f64],
    indices2: &[u32],
    distinct: usize,
    out: &mut [f64],
) {
    for l in 0..dims.category_count {
        let cat2 = &partials2[l * dims.partials_size..(l + 1) * dims.partials_size];
        let mut u = l * dims.partials_size;
        for k in 0..distinct {
            let state1 = states1[k] as usize;
            let child2 = &cat2[indices2[k] as usize * dims.state_count..][..dims.state_count];
            let mut w = l * dims.matrix_size;
            for _i in 0..dims.state_count {
                let tmp = matrices1[w + state1];
                let mut sum = 0.0;
                for p2 in child2 {
                    sum += matrices2[w] * p2;
                    w += 1;
                }
                // skip the sentinel column
                w += 1;
                out[u] = tmp * sum;
                u += 1;
            }
        }
    }
}

/// Both children carry partials.
pub(crate) fn partials_partials(
    dims: &KernelDims,
    matrices1: &[f64],
    partials1: &[f64],
    indices1: &[u32],
    matrices2: &[f64],
    partials2: &[f64],
    indices2: &[u32],
    distinct: usize,
    out: &mut [f64],
) {
    for l in 0..dims.category_count {
        let cat1 = &partials1[l * dims.partials_size..(l + 1) * dims.partials_size];
        let cat2 = &partials2[l * dims.partials_size..(l + 1) * dims.partials_size];
        let mut u = l * dims.partials_size;
        for k in 0..distinct {
            let child1 = &cat1[indices1[k] as usize * dims.state_count..][..dims.state_count];
            let child2 = &cat2[indices2[k] as usize * dims.state_count..][..dims.state_count];
            let mut w = l * dims.matrix_size;
            for _i in 0..dims.state_count {
                let mut sum1 = 0.0;
                let mut sum2 = 0.0;
                for j in 0..dims.state_count {
                    sum1 += matrices1[w] * child1[j];
                    sum2 += matrices2[w] * child2[j];
                    w += 1;
                }
                // skip the sentinel column
                w += 1;
                out[u] = sum1 * sum2;
                u += 1;
            }
        }
    }
}
