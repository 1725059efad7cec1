use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::arr2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::Instant;

use treelik::{LikelihoodEngine, Operation};

#[derive(Parser, Debug)]
#[command(name = "bench")]
#[command(about = "Synthetic-tree benchmark for the pruning engine", long_about = None)]
struct Cli {
    #[arg(long, default_value_t = 128)]
    tips: usize,
    #[arg(long, default_value_t = 1024)]
    patterns: usize,
    #[arg(long, default_value_t = 4)]
    categories: usize,
    #[arg(long, default_value_t = 2000)]
    iterations: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, help = "Enable underflow rescaling")]
    scaling: bool,
    #[arg(long)]
    no_progress: bool,
    #[arg(long, help = "Write a JSON summary of the run")]
    json_out: Option<PathBuf>,
}

#[derive(Serialize)]
struct BenchSummary {
    tips: usize,
    patterns: usize,
    categories: usize,
    iterations: usize,
    scaling: bool,
    elapsed_secs: f64,
    updates_per_sec: f64,
    log_likelihood: f64,
}

const JC_EIGENVALUES: [f64; 4] = [0.0, -4.0 / 3.0, -4.0 / 3.0, -4.0 / 3.0];
const JC_FREQUENCIES: [f64; 4] = [0.25, 0.25, 0.25, 0.25];

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::with_template(
            "{msg} [{elapsed_precise}] {bar:40.green/238} {pos}/{len} ({per_sec})",
        )
        .unwrap()
        .progress_chars("=> "),
    );
    pb
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.tips < 2 {
        bail!("--tips must be at least 2");
    }
    if cli.patterns == 0 || cli.categories == 0 {
        bail!("--patterns and --categories must be positive");
    }

    let tips = cli.tips;
    let node_count = 2 * tips - 1;
    let mut rng = SmallRng::seed_from_u64(cli.seed);

    // Balanced topology: pair up available subtree roots first-in
    // first-out until a single root remains.
    let mut available: VecDeque<usize> = (0..tips).collect();
    let mut children = vec![(0usize, 0usize); node_count];
    let mut parent = vec![usize::MAX; node_count];
    let mut full_ops = Vec::with_capacity(tips - 1);
    let mut next = tips;
    while available.len() > 1 {
        let a = available.pop_front().unwrap();
        let b = available.pop_front().unwrap();
        full_ops.push(Operation::new(a, b, next));
        children[next] = (a, b);
        parent[a] = next;
        parent[b] = next;
        available.push_back(next);
        next += 1;
    }
    let root = next - 1;

    let mut branch_lengths = vec![0.0f64; node_count];
    for (node, t) in branch_lengths.iter_mut().enumerate() {
        if node != root {
            *t = rng.gen_range(0.01..0.5);
        }
    }

    let mut engine = LikelihoodEngine::new(4, node_count, tips, cli.patterns, cli.categories)?;
    engine.set_scaling(cli.scaling)?;

    let mut states = vec![0u32; cli.patterns];
    for tip in 0..tips {
        for s in states.iter_mut() {
            *s = if rng.gen_ratio(1, 50) {
                4
            } else {
                rng.gen_range(0..4)
            };
        }
        engine.set_tip_states(tip, &states)?;
    }

    let eigenvectors = arr2(&[
        [1.0, 2.0, 0.0, 0.5],
        [1.0, -2.0, 0.5, 0.0],
        [1.0, 2.0, 0.0, -0.5],
        [1.0, -2.0, -0.5, 0.0],
    ]);
    let inverse_eigenvectors = arr2(&[
        [0.25, 0.25, 0.25, 0.25],
        [0.125, -0.125, 0.125, -0.125],
        [0.0, 1.0, 0.0, -1.0],
        [1.0, 0.0, -1.0, 0.0],
    ]);
    engine.set_model(
        &JC_FREQUENCIES,
        &eigenvectors,
        &inverse_eigenvectors,
        &JC_EIGENVALUES,
    )?;
    let rates: Vec<f64> = (0..cli.categories)
        .map(|l| 0.5 + l as f64 / cli.categories as f64)
        .collect();
    let proportions = vec![1.0 / cli.categories as f64; cli.categories];
    engine.set_rate_model(&rates, &proportions)?;

    let non_root: Vec<usize> = (0..node_count).filter(|&n| n != root).collect();
    let non_root_lengths: Vec<f64> = non_root.iter().map(|&n| branch_lengths[n]).collect();
    engine.update_matrices(&non_root, &non_root_lengths)?;
    engine.propagate(&full_ops)?;
    let weights = vec![1.0f64; cli.patterns];
    let mut log_likelihood = engine.total_log_likelihood(root, &weights)?;
    engine.commit()?;

    let pb = if cli.no_progress {
        None
    } else {
        let pb = progress_bar(cli.iterations as u64);
        pb.set_message("bench");
        Some(pb)
    };

    let mut chain_ops = Vec::with_capacity(64);
    let start = Instant::now();
    for _ in 0..cli.iterations {
        engine.commit()?;
        let tip = rng.gen_range(0..tips);
        let proposed = rng.gen_range(0.01..0.5);
        engine.update_matrices(&[tip], &[proposed])?;

        chain_ops.clear();
        let mut node = parent[tip];
        while node != usize::MAX {
            let (a, b) = children[node];
            chain_ops.push(Operation::new(a, b, node));
            node = parent[node];
        }
        engine.propagate(&chain_ops)?;
        let proposed_ll = engine.total_log_likelihood(root, &weights)?;

        if rng.gen_bool(0.5) {
            log_likelihood = proposed_ll;
        } else {
            engine.rollback()?;
        }
        if let Some(pb) = &pb {
            pb.inc(1);
        }
    }
    let elapsed = start.elapsed().as_secs_f64();
    if let Some(pb) = pb {
        pb.finish_with_message("bench done");
    }

    let updates_per_sec = cli.iterations as f64 / elapsed;
    println!(
        "{} tips, {} patterns, {} categories: {} incremental updates in {:.3}s ({:.1}/s), final logL = {:.6}",
        tips, cli.patterns, cli.categories, cli.iterations, elapsed, updates_per_sec, log_likelihood
    );

    if let Some(path) = &cli.json_out {
        let summary = BenchSummary {
            tips,
            patterns: cli.patterns,
            categories: cli.categories,
            iterations: cli.iterations,
            scaling: cli.scaling,
            elapsed_secs: elapsed,
            updates_per_sec,
            log_likelihood,
        };
        let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &summary)
            .with_context(|| format!("failed to write {:?}", path))?;
    }
    Ok(())
}
