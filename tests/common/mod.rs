#![allow(dead_code)]


use ndarray::{arr2, Array2};
use treelik::{LikelihoodEngine, Operation};

pub fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

/// JC69 eigensystem with branch lengths in expected substitutions per site.
pub struct JcModel {
    pub frequencies: [f64; 4],
    pub eigenvalues: [f64; 4],
    pub eigenvectors: Array2<f64>,
    pub inverse_eigenvectors: Array2<f64>,
}

pub fn jc_model() -> JcModel {
    JcModel {
        frequencies: [0.25; 4],
        eigenvalues: [0.0, -4.0 / 3.0, -4.0 / 3.0, -4.0 / 3.0],
        eigenvectors: arr2(&[
            [1.0, 2.0, 0.0, 0.5],
            [1.0, -2.0, 0.5, 0.0],
            [1.0, 2.0, 0.0, -0.5],
            [1.0, -2.0, -0.5, 0.0],
        ]),
        inverse_eigenvectors: arr2(&[
            [0.25, 0.25, 0.25, 0.25],
            [0.125, -0.125, 0.125, -0.125],
            [0.0, 1.0, 0.0, -1.0],
            [1.0, 0.0, -1.0, 0.0],
        ]),
    }
}

/// JC transition probability for two states at distance `t`.
pub fn jc_transition(same: bool, t: f64) -> f64 {
    let e = (-4.0 * t / 3.0).exp();
    if same {
        0.25 + 0.75 * e
    } else {
        0.25 - 0.25 * e
    }
}

pub fn nucleotide_code(ch: u8) -> u32 {
    match ch {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => 4,
    }
}

/// Deduplicate alignment columns into site patterns. Returns one code
/// vector per taxon (pattern-indexed) and the pattern multiplicities.
pub fn compress_alignment(sequences: &[&str]) -> (Vec<Vec<u32>>, Vec<f64>) {
    let n_taxa = sequences.len();
    let len = sequences[0].len();
    for s in sequences {
        assert_eq!(s.len(), len, "alignment rows must have equal length");
    }
    let rows: Vec<&[u8]> = sequences.iter().map(|s| s.as_bytes()).collect();
    let mut seen: std::collections::HashMap<Vec<u32>, usize> = std::collections::HashMap::new();
    let mut patterns: Vec<Vec<u32>> = vec![Vec::new(); n_taxa];
    let mut weights: Vec<f64> = Vec::new();
    for site in 0..len {
        let column: Vec<u32> = rows.iter().map(|r| nucleotide_code(r[site])).collect();
        match seen.get(&column) {
            Some(&idx) => weights[idx] += 1.0,
            None => {
                seen.insert(column.clone(), weights.len());
                for (taxon, &code) in column.iter().enumerate() {
                    patterns[taxon].push(code);
                }
                weights.push(1.0);
            }
        }
    }
    (patterns, weights)
}

/// Everything a test needs to drive the engine over a fixed tree.
pub struct TreeFixture {
    pub node_count: usize,
    pub tip_count: usize,
    pub branch_lengths: Vec<f64>,
    pub ops: Vec<Operation>,
    pub root: usize,
}

impl TreeFixture {
    pub fn non_root_nodes(&self) -> Vec<usize> {
        (0..self.node_count).filter(|&n| n != self.root).collect()
    }

    pub fn non_root_lengths(&self) -> Vec<f64> {
        self.non_root_nodes()
            .iter()
            .map(|&n| self.branch_lengths[n])
            .collect()
    }
}

/// The three-tip ultrametric tree: tip 0 sits on a branch of length 2.0
/// from the root, tips 1 and 2 on branches of length 1.0 under a parent
/// that is itself 1.0 below the root.
pub fn three_tip_tree() -> TreeFixture {
    TreeFixture {
        node_count: 5,
        tip_count: 3,
        branch_lengths: vec![2.0, 1.0, 1.0, 1.0, 0.0],
        ops: vec![Operation::new(1, 2, 3), Operation::new(0, 3, 4)],
        root: 4,
    }
}

/// Balanced four-tip tree: ((0,1),(2,3)) with internal nodes 4, 5 and
/// root 6.
pub fn four_tip_tree() -> TreeFixture {
    TreeFixture {
        node_count: 7,
        tip_count: 4,
        branch_lengths: vec![0.1, 0.2, 0.3, 0.4, 0.05, 0.15, 0.0],
        ops: vec![
            Operation::new(0, 1, 4),
            Operation::new(2, 3, 5),
            Operation::new(4, 5, 6),
        ],
        root: 6,
    }
}

/// Six-taxon primate topology with the upstream branch lengths; tips are
/// human, chimp, bonobo, gorilla, orangutan, siamang in index order, with
/// internal nodes 6..=10 and the root at 10.
pub fn primate_tree() -> TreeFixture {
    TreeFixture {
        node_count: 11,
        tip_count: 6,
        branch_lengths: vec![
            0.024003, // human
            0.010772, // chimp
            0.010772, // bonobo
            0.036038, // gorilla
            0.069125, // orangutan
            0.099582, // siamang
            0.013231, // (chimp, bonobo)
            0.012035, // (human, (chimp, bonobo))
            0.033087, // (.., gorilla)
            0.030457, // (.., orangutan)
            0.0,      // root
        ],
        ops: vec![
            Operation::new(1, 2, 6),
            Operation::new(0, 6, 7),
            Operation::new(7, 3, 8),
            Operation::new(8, 4, 9),
            Operation::new(9, 5, 10),
        ],
        root: 10,
    }
}

/// Build an engine over a tree fixture with states tips, push the model,
/// run one full postorder evaluation.
pub struct EngineSetup<'a> {
    pub frequencies: &'a [f64],
    pub eigenvalues: &'a [f64],
    pub eigenvectors: &'a Array2<f64>,
    pub inverse_eigenvectors: &'a Array2<f64>,
    pub rates: &'a [f64],
    pub proportions: &'a [f64],
    pub scaling: bool,
}

pub fn build_engine(
    tree: &TreeFixture,
    tip_patterns: &[Vec<u32>],
    setup: &EngineSetup,
) -> LikelihoodEngine {
    let pattern_count = tip_patterns[0].len();
    let mut engine = LikelihoodEngine::new(
        setup.frequencies.len(),
        tree.node_count,
        tree.tip_count,
        pattern_count,
        setup.rates.len(),
    )
    .expect("engine construction failed");
    engine.set_scaling(setup.scaling).expect("set_scaling failed");
    for (tip, states) in tip_patterns.iter().enumerate() {
        engine.set_tip_states(tip, states).expect("set_tip_states failed");
    }
    engine
        .set_model(
            setup.frequencies,
            setup.eigenvectors,
            setup.inverse_eigenvectors,
            setup.eigenvalues,
        )
        .expect("set_model failed");
    engine
        .set_rate_model(setup.rates, setup.proportions)
        .expect("set_rate_model failed");
    engine
        .update_matrices(&tree.non_root_nodes(), &tree.non_root_lengths())
        .expect("update_matrices failed");
    engine.propagate(&tree.ops).expect("propagate failed");
    engine
}

/// Per-site pruning with no pattern compression, mirroring the engine's
/// floating-point operation order exactly so results can be compared
/// bit for bit (scaling off).
pub fn naive_log_likelihoods(
    tree: &TreeFixture,
    tip_patterns: &[Vec<u32>],
    setup: &EngineSetup,
) -> Vec<f64> {
    let state_count = setup.frequencies.len();
    let category_count = setup.rates.len();
    let pattern_count = tip_patterns[0].len();
    let matrix_size = (state_count + 1) * state_count;
    let partials_size = pattern_count * state_count;
    let sentinel = state_count as u32;

    let mut cmatrix = vec![0.0f64; state_count * state_count * state_count];
    let mut l = 0;
    for i in 0..state_count {
        for j in 0..state_count {
            for k in 0..state_count {
                cmatrix[l] = setup.eigenvectors[[i, k]] * setup.inverse_eigenvectors[[k, j]];
                l += 1;
            }
        }
    }

    let mut matrices = vec![vec![0.0f64; category_count * matrix_size]; tree.node_count];
    let mut expt = vec![0.0f64; state_count];
    for node in 0..tree.node_count {
        let out = &mut matrices[node];
        let mut n = 0;
        for &rate in setup.rates {
            for (i, e) in expt.iter_mut().enumerate() {
                *e = (setup.eigenvalues[i] * tree.branch_lengths[node] * rate).exp();
            }
            let mut m = 0;
            for _i in 0..state_count {
                for _j in 0..state_count {
                    let mut sum = 0.0;
                    for e in expt.iter() {
                        sum += cmatrix[m] * e;
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

    let mut partials = vec![vec![0.0f64; category_count * partials_size]; tree.node_count];
    let is_tip = |node: usize| node < tree.tip_count;
    let code = |node: usize, site: usize| tip_patterns[node][site].min(sentinel) as usize;

    for op in &tree.ops {
        let (c1, c2, p) = (op.child1, op.child2, op.parent);
        // order the children as the engine's dispatch does
        let (c1, c2) = if !is_tip(c1) && is_tip(c2) { (c2, c1) } else { (c1, c2) };
        for lcat in 0..category_count {
            let mut u = lcat * partials_size;
            for site in 0..pattern_count {
                let mut w = lcat * matrix_size;
                if is_tip(c1) && is_tip(c2) {
                    let s1 = code(c1, site);
                    let s2 = code(c2, site);
                    for _i in 0..state_count {
                        let value = matrices[c1][w + s1] * matrices[c2][w + s2];
                        partials[p][u] = value;
                        u += 1;
                        w += state_count + 1;
                    }
                } else if is_tip(c1) {
                    let s1 = code(c1, site);
                    let off = lcat * partials_size + site * state_count;
                    for _i in 0..state_count {
                        let tmp = matrices[c1][w + s1];
                        let mut sum = 0.0;
                        for j in 0..state_count {
                            sum += matrices[c2][w] * partials[c2][off + j];
                            w += 1;
                        }
                        w += 1;
                        partials[p][u] = tmp * sum;
                        u += 1;
                    }
                } else {
                    let off1 = lcat * partials_size + site * state_count;
                    let off2 = lcat * partials_size + site * state_count;
                    for _i in 0..state_count {
                        let mut sum1 = 0.0;
                        let mut sum2 = 0.0;
                        for j in 0..state_count {
                            sum1 += matrices[c1][w] * partials[c1][off1 + j];
                            sum2 += matrices[c2][w] * partials[c2][off2 + j];
                            w += 1;
                        }
                        w += 1;
                        partials[p][u] = sum1 * sum2;
                        u += 1;
                    }
                }
            }
        }
    }

    let root = &partials[tree.root];
    let mut out = vec![0.0f64; pattern_count];
    let mut mix = vec![0.0f64; state_count];
    for (site, ll) in out.iter_mut().enumerate() {
        let offset = site * state_count;
        for (s, m) in mix.iter_mut().enumerate() {
            *m = setup.proportions[0] * root[offset + s];
        }
        for lcat in 1..category_count {
            let cat = lcat * partials_size + offset;
            for (s, m) in mix.iter_mut().enumerate() {
                *m += setup.proportions[lcat] * root[cat + s];
            }
        }
        let mut sum = 0.0;
        for (s, &m) in mix.iter().enumerate() {
            sum += setup.frequencies[s] * m;
        }
        *ll = sum.ln();
    }
    out
}
