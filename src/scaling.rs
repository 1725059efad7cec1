/// Rescale trigger: a compressed column whose maximum partial falls below
/// this is normalized to keep magnitudes clear of double underflow across
/// deep trees; most columns never get near it.
pub(crate) const RESCALE_THRESHOLD: f64 = 1e-40;

/// Normalize a node's freshly computed partials, column by column, and
/// record per-site log scale factors.
///
/// For each distinct compressed column the maximum over all categories and
/// states is found; when `0 < max < RESCALE_THRESHOLD` the column is
/// divided through by the maximum and `ln(max)` becomes the scale factor of
/// every site mapping to that column, otherwise the factor is 0.0. An
/// all-zero column is left untouched so a zero-probability configuration
/// still reaches the root as 0.0 rather than NaN.
pub(crate) fn rescale_columns(
    partials: &mut [f64],
    scale_row: &mut [f64],
    site_map: &[u32],
    distinct: usize,
    category_count: usize,
    state_count: usize,
    partials_size: usize,
    column_log: &mut [f64],
) {
    for k in 0..distinct {
        let mut max = 0.0f64;
        for l in 0..category_count {
            let col = &partials[l * partials_size + k * state_count..][..state_count];
            for &x in col {
                if x > max {
                    max = x;
                }
            }
        }
        if max > 0.0 && max < RESCALE_THRESHOLD {
            for l in 0..category_count {
                let col = &mut partials[l * partials_size + k * state_count..][..state_count];
                for x in col {
                    *x /= max;
                }
            }
            column_log[k] = max.ln();
        } else {
            column_log[k] = 0.0;
        }
    }
    for (site, &k) in site_map.iter().enumerate() {
        scale_row[site] = column_log[k as usize];
    }
}
