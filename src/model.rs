use ndarray::Array2;

/// One snapshot of the substitution and rate models: equilibrium
/// frequencies, eigenvalues, the flattened eigenvector product
/// `C[i,j,k] = Evec[i,k] * Ievc[k,j]`, and the category rates/proportions.
#[derive(Debug, Clone)]
pub(crate) struct ModelSlot {
    pub frequencies: Vec<f64>,
    pub eigenvalues: Vec<f64>,
    pub cmatrix: Vec<f64>,
    pub category_rates: Vec<f64>,
    pub category_proportions: Vec<f64>,
}

impl ModelSlot {
    fn new(state_count: usize, category_count: usize) -> Self {
        Self {
            frequencies: vec![0.0; state_count],
            eigenvalues: vec![0.0; state_count],
            cmatrix: vec![0.0; state_count * state_count * state_count],
            category_rates: vec![0.0; category_count],
            category_proportions: vec![0.0; category_count],
        }
    }

    fn copy_from(&mut self, other: &ModelSlot) {
        self.frequencies.copy_from_slice(&other.frequencies);
        self.eigenvalues.copy_from_slice(&other.eigenvalues);
        self.cmatrix.copy_from_slice(&other.cmatrix);
        self.category_rates.copy_from_slice(&other.category_rates);
        self.category_proportions
            .copy_from_slice(&other.category_proportions);
    }
}

/// Double-buffered model snapshot. Writes go through [`ModelStore::writable`],
/// which switches away from the stored slot on the first write of a
/// transaction and carries the previous snapshot over, so `set_model` and
/// `set_rate_model` can be issued independently between commits.
#[derive(Debug, Clone)]
pub(crate) struct ModelStore {
    slots: [ModelSlot; 2],
    current: usize,
    stored: usize,
    state_count: usize,
}

impl ModelStore {
    pub fn new(state_count: usize, category_count: usize) -> Self {
        Self {
            slots: [
                ModelSlot::new(state_count, category_count),
                ModelSlot::new(state_count, category_count),
            ],
            current: 0,
            stored: 0,
            state_count,
        }
    }

    #[inline]
    pub fn current(&self) -> &ModelSlot {
        &self.slots[self.current]
    }

    fn writable(&mut self) -> &mut ModelSlot {
        if self.current == self.stored {
            self.current ^= 1;
            let (a, b) = self.slots.split_at_mut(1);
            if self.current == 0 {
                a[0].copy_from(&b[0]);
            } else {
                b[0].copy_from(&a[0]);
            }
        }
        &mut self.slots[self.current]
    }

    pub fn set_model(
        &mut self,
        frequencies: &[f64],
        eigenvectors: &Array2<f64>,
        inverse_eigenvectors: &Array2<f64>,
        eigenvalues: &[f64],
    ) {
        let n = self.state_count;
        let slot = self.writable();
        slot.frequencies.copy_from_slice(frequencies);
        slot.eigenvalues.copy_from_slice(eigenvalues);
        let mut l = 0;
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    slot.cmatrix[l] = eigenvectors[[i, k]] * inverse_eigenvectors[[k, j]];
                    l += 1;
                }
            }
        }
    }

    pub fn set_rate_model(&mut self, rates: &[f64], proportions: &[f64]) {
        let slot = self.writable();
        slot.category_rates.copy_from_slice(rates);
        slot.category_proportions.copy_from_slice(proportions);
    }

    pub fn commit(&mut self) {
        self.stored = self.current;
    }

    pub fn rollback(&mut self) {
        std::mem::swap(&mut self.current, &mut self.stored);
    }
}
