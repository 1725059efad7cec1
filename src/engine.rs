//! The likelihood engine proper: owns every per-node buffer, reacts to the
//! caller's update instructions, and evaluates per-pattern log-likelihoods
//! at the root.
//!
//! Call ordering is the caller's contract: refresh the model snapshot
//! before `update_matrices` when the model changed, issue `update_matrices`
//! for a node before any `propagate` operation that depends on it, and
//! supply `propagate` operations in postorder (children before parents).
//! The engine does not inspect tree structure and performs no staleness
//! checks; debug builds reject the two postorder violations that are
//! detectable within a single call. `commit` marks a proposal boundary and
//! `rollback` reverts to the last boundary; exactly one uncommitted delta
//! may exist at a time.

use anyhow::{bail, Result};
use ndarray::Array2;

use crate::buffers::{Arena, Slots};
use crate::kernels::{self, KernelDims};
use crate::matrices::build_matrices;
use crate::model::ModelStore;
use crate::patterns::{compress, PairInterner, PatternTables};
use crate::scaling::rescale_columns;

/// How a node contributes to the pruning recursion, resolved once instead
/// of being re-derived from index arithmetic at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Tip with observed discrete states.
    StatesTip,
    /// Tip seeded with observed partial likelihoods.
    PartialsTip,
    /// Interior node whose partials the engine computes.
    Internal,
}

/// One pruning step: compute `parent`'s partials from its two children.
#[derive(Debug, Clone, Copy)]
pub struct Operation {
    pub child1: usize,
    pub child2: usize,
    pub parent: usize,
}

impl Operation {
    pub fn new(child1: usize, child2: usize, parent: usize) -> Self {
        Self {
            child1,
            child2,
            parent,
        }
    }
}

pub struct LikelihoodEngine {
    state_count: usize,
    node_count: usize,
    state_tip_count: usize,
    pattern_count: usize,
    category_count: usize,
    matrix_size: usize,
    partials_size: usize,

    use_scaling: bool,
    released: bool,
    model_set: bool,
    rates_set: bool,

    kinds: Vec<NodeKind>,
    states_set: Vec<bool>,

    model: ModelStore,
    matrices: Arena<f64>,
    matrix_slots: Slots,
    partials: Arena<f64>,
    scale_factors: Arena<f64>,
    partial_slots: Slots,
    patterns: PatternTables,
    pattern_slots: Slots,
    interner: PairInterner,

    // preallocated scratch; the hot path never allocates
    expt: Vec<f64>,
    column_log: Vec<f64>,
    mix: Vec<f64>,
    scale_acc: Vec<f64>,
    site_ll: Vec<f64>,
    seen_child: Vec<bool>,
    seen_parent: Vec<bool>,
}

impl LikelihoodEngine {
    /// Allocate every buffer up front from the problem dimensions. Buffers
    /// persist for the engine's lifetime and are mutated in place.
    pub fn new(
        state_count: usize,
        node_count: usize,
        state_tip_count: usize,
        pattern_count: usize,
        category_count: usize,
    ) -> Result<Self> {
        if state_count < 2 {
            bail!("state count must be at least 2, got {state_count}");
        }
        if node_count == 0 || pattern_count == 0 || category_count == 0 {
            bail!(
                "node, pattern and category counts must be positive, got {node_count}/{pattern_count}/{category_count}"
            );
        }
        if state_tip_count > node_count {
            bail!(
                "state tip count {state_tip_count} exceeds node count {node_count}"
            );
        }
        let matrix_size = (state_count + 1) * state_count;
        let partials_size = pattern_count * state_count;
        let mut kinds = vec![NodeKind::Internal; node_count];
        for kind in kinds.iter_mut().take(state_tip_count) {
            *kind = NodeKind::StatesTip;
        }
        Ok(Self {
            state_count,
            node_count,
            state_tip_count,
            pattern_count,
            category_count,
            matrix_size,
            partials_size,
            use_scaling: false,
            released: false,
            model_set: false,
            rates_set: false,
            kinds,
            states_set: vec![false; node_count],
            model: ModelStore::new(state_count, category_count),
            matrices: Arena::new(node_count, category_count * matrix_size),
            matrix_slots: Slots::new(node_count),
            partials: Arena::new(node_count, category_count * partials_size),
            scale_factors: Arena::new(node_count, pattern_count),
            partial_slots: Slots::new(node_count),
            patterns: PatternTables::new(node_count, pattern_count),
            pattern_slots: Slots::new(node_count),
            interner: PairInterner::new(pattern_count),
            expt: vec![0.0; state_count],
            column_log: vec![0.0; pattern_count],
            mix: vec![0.0; state_count],
            scale_acc: vec![0.0; pattern_count],
            site_ll: vec![0.0; pattern_count],
            seen_child: vec![false; node_count],
            seen_parent: vec![false; node_count],
        })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released {
            bail!("engine has been released");
        }
        Ok(())
    }

    pub fn state_count(&self) -> usize {
        self.state_count
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn pattern_count(&self) -> usize {
        self.pattern_count
    }

    pub fn category_count(&self) -> usize {
        self.category_count
    }

    pub fn node_kind(&self, node: usize) -> Result<NodeKind> {
        self.ensure_live()?;
        if node >= self.node_count {
            bail!("node index {node} out of range ({} nodes)", self.node_count);
        }
        Ok(self.kinds[node])
    }

    pub fn scaling_enabled(&self) -> bool {
        self.use_scaling
    }

    pub fn set_scaling(&mut self, on: bool) -> Result<()> {
        self.ensure_live()?;
        self.use_scaling = on;
        Ok(())
    }

    /// Observed state codes for a state-typed tip, one per site pattern.
    /// Codes at or above the state count denote ambiguity or gaps and are
    /// pinned to the sentinel index. Tip data is constant for the run, so
    /// both buffer slots receive it.
    pub fn set_tip_states(&mut self, tip: usize, states: &[u32]) -> Result<()> {
        self.ensure_live()?;
        if tip >= self.state_tip_count {
            bail!(
                "node {tip} is not a state-typed tip (state tip count {})",
                self.state_tip_count
            );
        }
        if states.len() != self.pattern_count {
            bail!(
                "tip state vector length {} does not match pattern count {}",
                states.len(),
                self.pattern_count
            );
        }
        let sentinel = self.state_count as u32;
        for slot in 0..2 {
            let map = self.patterns.maps.row_mut(tip, slot);
            for (m, &s) in map.iter_mut().zip(states) {
                *m = s.min(sentinel);
            }
        }
        self.states_set[tip] = true;
        Ok(())
    }

    /// Observed partial likelihoods for a tip that is not state-typed,
    /// `pattern_count * state_count` values, replicated across categories.
    pub fn set_tip_partials(&mut self, tip: usize, tip_partials: &[f64]) -> Result<()> {
        self.ensure_live()?;
        if tip < self.state_tip_count {
            bail!("node {tip} is a state-typed tip and cannot take partials");
        }
        if tip >= self.node_count {
            bail!("node index {tip} out of range ({} nodes)", self.node_count);
        }
        if tip_partials.len() != self.partials_size {
            bail!(
                "tip partials length {} does not match pattern count * state count = {}",
                tip_partials.len(),
                self.partials_size
            );
        }
        self.kinds[tip] = NodeKind::PartialsTip;
        for slot in 0..2 {
            let row = self.partials.row_mut(tip, slot);
            for l in 0..self.category_count {
                row[l * self.partials_size..(l + 1) * self.partials_size]
                    .copy_from_slice(tip_partials);
            }
            let map = self.patterns.maps.row_mut(tip, slot);
            for (i, m) in map.iter_mut().enumerate() {
                *m = i as u32;
            }
            self.patterns.counts[tip * 2 + slot] = self.pattern_count as u32;
        }
        Ok(())
    }

    /// Refresh the substitution-model snapshot: equilibrium frequencies,
    /// eigenvectors, inverse eigenvectors, and eigenvalues. Recomputes the
    /// flattened eigenvector product used by the matrix builder.
    pub fn set_model(
        &mut self,
        frequencies: &[f64],
        eigenvectors: &Array2<f64>,
        inverse_eigenvectors: &Array2<f64>,
        eigenvalues: &[f64],
    ) -> Result<()> {
        self.ensure_live()?;
        let n = self.state_count;
        if frequencies.len() != n {
            bail!("frequency vector length {} does not match state count {n}", frequencies.len());
        }
        if eigenvalues.len() != n {
            bail!("eigenvalue vector length {} does not match state count {n}", eigenvalues.len());
        }
        if eigenvectors.nrows() != n || eigenvectors.ncols() != n {
            bail!("eigenvector matrix shape mismatch, expected {n}x{n}");
        }
        if inverse_eigenvectors.nrows() != n || inverse_eigenvectors.ncols() != n {
            bail!("inverse eigenvector matrix shape mismatch, expected {n}x{n}");
        }
        self.model
            .set_model(frequencies, eigenvectors, inverse_eigenvectors, eigenvalues);
        self.model_set = true;
        Ok(())
    }

    /// Refresh the rate-heterogeneity snapshot: one rate and one mixture
    /// proportion per category.
    pub fn set_rate_model(&mut self, rates: &[f64], proportions: &[f64]) -> Result<()> {
        self.ensure_live()?;
        if rates.len() != self.category_count {
            bail!(
                "category rate vector length {} does not match category count {}",
                rates.len(),
                self.category_count
            );
        }
        if proportions.len() != self.category_count {
            bail!(
                "category proportion vector length {} does not match category count {}",
                proportions.len(),
                self.category_count
            );
        }
        self.model.set_rate_model(rates, proportions);
        self.rates_set = true;
        Ok(())
    }

    /// Rebuild the transition matrices of the listed nodes from their new
    /// branch lengths, flipping each node's matrix slot first. The caller
    /// must have refreshed the model snapshot beforehand if it changed.
    pub fn update_matrices(&mut self, nodes: &[usize], branch_lengths: &[f64]) -> Result<()> {
        self.ensure_live()?;
        if !self.model_set || !self.rates_set {
            bail!("model and rate snapshots must be set before updating matrices");
        }
        if nodes.len() != branch_lengths.len() {
            bail!(
                "node list length {} does not match branch length list {}",
                nodes.len(),
                branch_lengths.len()
            );
        }
        for (&node, &t) in nodes.iter().zip(branch_lengths) {
            if node >= self.node_count {
                bail!("node index {node} out of range ({} nodes)", self.node_count);
            }
            if !t.is_finite() || t < 0.0 {
                bail!("branch length {t} for node {node} is not finite and non-negative");
            }
        }
        for (&node, &t) in nodes.iter().zip(branch_lengths) {
            let slot = self.matrix_slots.flip(node);
            build_matrices(
                self.model.current(),
                t,
                self.state_count,
                &mut self.expt,
                self.matrices.row_mut(node, slot),
            );
        }
        Ok(())
    }

    /// Run the pruning recursion over the supplied operations, strictly in
    /// order. Children must come before any parent that depends on them;
    /// the engine trusts the caller on this in release builds.
    pub fn propagate(&mut self, operations: &[Operation]) -> Result<()> {
        self.ensure_live()?;
        if !self.model_set || !self.rates_set {
            bail!("model and rate snapshots must be set before propagating");
        }
        self.seen_parent.fill(false);
        for op in operations {
            self.check_operation(op)?;
            // an internal child must have been computed, either by an
            // earlier pass or by an earlier operation in this one; a zero
            // count marks a node whose partials were never produced
            for &c in &[op.child1, op.child2] {
                if self.kinds[c] == NodeKind::Internal
                    && !self.seen_parent[c]
                    && self.patterns.counts[c * 2 + self.pattern_slots.current(c)] == 0
                {
                    bail!("node {c} has no computed partials to propagate from");
                }
            }
            self.seen_parent[op.parent] = true;
        }
        if cfg!(debug_assertions) {
            self.validate_postorder(operations)?;
        }

        let dims = KernelDims {
            state_count: self.state_count,
            category_count: self.category_count,
            matrix_size: self.matrix_size,
            partials_size: self.partials_size,
        };

        for op in operations {
            let (c1, c2, p) = (op.child1, op.child2, op.parent);

            let p_pat = self.pattern_slots.flip(p);
            let p_part = self.partial_slots.flip(p);

            let distinct = {
                let c1_pat = (c1, self.pattern_slots.current(c1));
                let c2_pat = (c2, self.pattern_slots.current(c2));
                let (parent_map, map1, map2) =
                    self.patterns.maps.row_mut_read2((p, p_pat), c1_pat, c2_pat);
                compress(
                    map1,
                    map2,
                    parent_map,
                    self.patterns.pair1.row_mut(p, p_pat),
                    self.patterns.pair2.row_mut(p, p_pat),
                    &mut self.interner,
                )
            };
            self.patterns.counts[p * 2 + p_pat] = distinct;
            let distinct = distinct as usize;

            let mat1 = self.matrices.row(c1, self.matrix_slots.current(c1));
            let mat2 = self.matrices.row(c2, self.matrix_slots.current(c2));
            let pair1 = self.patterns.pair1.row(p, p_pat);
            let pair2 = self.patterns.pair2.row(p, p_pat);
            let states1 = self.kinds[c1] == NodeKind::StatesTip;
            let states2 = self.kinds[c2] == NodeKind::StatesTip;
            match (states1, states2) {
                (true, true) => {
                    let out = self.partials.row_mut(p, p_part);
                    kernels::states_states(&dims, mat1, mat2, pair1, pair2, distinct, out);
                }
                (true, false) => {
                    let (out, part2) = self
                        .partials
                        .row_mut_read((p, p_part), (c2, self.partial_slots.current(c2)));
                    kernels::states_partials(
                        &dims, mat1, pair1, mat2, part2, pair2, distinct, out,
                    );
                }
                (false, true) => {
                    let (out, part1) = self
                        .partials
                        .row_mut_read((p, p_part), (c1, self.partial_slots.current(c1)));
                    kernels::states_partials(
                        &dims, mat2, pair2, mat1, part1, pair1, distinct, out,
                    );
                }
                (false, false) => {
                    let (out, part1, part2) = self.partials.row_mut_read2(
                        (p, p_part),
                        (c1, self.partial_slots.current(c1)),
                        (c2, self.partial_slots.current(c2)),
                    );
                    kernels::partials_partials(
                        &dims, mat1, part1, pair1, mat2, part2, pair2, distinct, out,
                    );
                }
            }

            if self.use_scaling {
                rescale_columns(
                    self.partials.row_mut(p, p_part),
                    self.scale_factors.row_mut(p, p_part),
                    self.patterns.maps.row(p, p_pat),
                    distinct,
                    self.category_count,
                    self.state_count,
                    self.partials_size,
                    &mut self.column_log,
                );
            }
        }
        Ok(())
    }

    fn check_operation(&self, op: &Operation) -> Result<()> {
        let (c1, c2, p) = (op.child1, op.child2, op.parent);
        for &node in &[c1, c2, p] {
            if node >= self.node_count {
                bail!("node index {node} out of range ({} nodes)", self.node_count);
            }
        }
        if c1 == c2 || c1 == p || c2 == p {
            bail!("operation nodes must be distinct, got ({c1}, {c2}, {p})");
        }
        if self.kinds[p] != NodeKind::Internal {
            bail!("node {p} cannot be a partials destination");
        }
        for &c in &[c1, c2] {
            if self.kinds[c] == NodeKind::StatesTip && !self.states_set[c] {
                bail!("tip states have not been set for node {c}");
            }
        }
        Ok(())
    }

    /// Debug-only detection of postorder violations visible within one
    /// call: a node updated twice, or updated after already having been
    /// consumed as a child.
    fn validate_postorder(&mut self, operations: &[Operation]) -> Result<()> {
        self.seen_child.fill(false);
        self.seen_parent.fill(false);
        for op in operations {
            if self.seen_parent[op.parent] {
                bail!("node {} updated twice in one propagation pass", op.parent);
            }
            if self.seen_child[op.parent] {
                bail!(
                    "node {} updated after being consumed as a child in the same pass",
                    op.parent
                );
            }
            self.seen_parent[op.parent] = true;
            self.seen_child[op.child1] = true;
            self.seen_child[op.child2] = true;
        }
        Ok(())
    }

    /// Per-pattern log-likelihoods at the root: category proportions mix
    /// the root partials, equilibrium frequencies weight the states, and
    /// accumulated scale factors are added back. The caller weights the
    /// output by pattern multiplicities.
    pub fn log_likelihoods(&mut self, root: usize, out: &mut [f64]) -> Result<()> {
        self.ensure_live()?;
        if root >= self.node_count {
            bail!("node index {root} out of range ({} nodes)", self.node_count);
        }
        if self.kinds[root] == NodeKind::StatesTip {
            bail!("root node {root} does not carry partials");
        }
        if self.kinds[root] == NodeKind::Internal
            && self.patterns.counts[root * 2 + self.pattern_slots.current(root)] == 0
        {
            bail!("root node {root} has no computed partials");
        }
        if out.len() != self.pattern_count {
            bail!(
                "output length {} does not match pattern count {}",
                out.len(),
                self.pattern_count
            );
        }
        if !self.model_set || !self.rates_set {
            bail!("model and rate snapshots must be set before evaluating");
        }

        self.scale_acc.fill(0.0);
        if self.use_scaling {
            for node in 0..self.node_count {
                let row = self.scale_factors.row(node, self.partial_slots.current(node));
                for (acc, &v) in self.scale_acc.iter_mut().zip(row) {
                    *acc += v;
                }
            }
        }

        let model = self.model.current();
        let map = self.patterns.maps.row(root, self.pattern_slots.current(root));
        let root_partials = self.partials.row(root, self.partial_slots.current(root));
        for (site, ll) in out.iter_mut().enumerate() {
            let offset = map[site] as usize * self.state_count;
            for (s, m) in self.mix.iter_mut().enumerate() {
                *m = model.category_proportions[0] * root_partials[offset + s];
            }
            for l in 1..self.category_count {
                let cat = l * self.partials_size + offset;
                for (s, m) in self.mix.iter_mut().enumerate() {
                    *m += model.category_proportions[l] * root_partials[cat + s];
                }
            }
            let mut sum = 0.0;
            for (s, &m) in self.mix.iter().enumerate() {
                sum += model.frequencies[s] * m;
            }
            *ll = sum.ln() + self.scale_acc[site];
        }
        Ok(())
    }

    /// Pattern log-likelihoods reduced by the caller's multiplicities.
    pub fn total_log_likelihood(&mut self, root: usize, pattern_weights: &[f64]) -> Result<f64> {
        self.ensure_live()?;
        if pattern_weights.len() != self.pattern_count {
            bail!(
                "weight vector length {} does not match pattern count {}",
                pattern_weights.len(),
                self.pattern_count
            );
        }
        let mut site_ll = std::mem::take(&mut self.site_ll);
        let result = self.log_likelihoods(root, &mut site_ll);
        let total = site_ll
            .iter()
            .zip(pattern_weights)
            .map(|(ll, w)| ll * w)
            .sum();
        self.site_ll = site_ll;
        result?;
        Ok(total)
    }

    /// Distinct compressed-pattern count currently valid at a node that
    /// carries partials.
    pub fn distinct_pattern_count(&self, node: usize) -> Result<usize> {
        self.ensure_live()?;
        if node >= self.node_count {
            bail!("node index {node} out of range ({} nodes)", self.node_count);
        }
        if self.kinds[node] == NodeKind::StatesTip {
            bail!("node {node} holds tip states, not partials");
        }
        Ok(self.patterns.counts[node * 2 + self.pattern_slots.current(node)] as usize)
    }

    /// Seal the current state as the transaction baseline. Copies slot
    /// labels only, never buffer contents.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.model.commit();
        self.matrix_slots.commit();
        self.partial_slots.commit();
        self.pattern_slots.commit();
        Ok(())
    }

    /// Revert every buffered quantity to the last committed baseline by
    /// swapping slot labels.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.model.rollback();
        self.matrix_slots.rollback();
        self.partial_slots.rollback();
        self.pattern_slots.rollback();
        Ok(())
    }

    /// Release all buffers. Every subsequent operation fails with a
    /// lifecycle error.
    pub fn release(&mut self) {
        self.matrices.free();
        self.partials.free();
        self.scale_factors.free();
        self.patterns.maps.free();
        self.patterns.pair1.free();
        self.patterns.pair2.free();
        self.released = true;
    }
}
