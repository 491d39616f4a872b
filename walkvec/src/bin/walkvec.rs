use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use walkvec::export::{write_binary, write_text};
use walkvec::{real, ModelConfig, Placement, SkipGramModel, Snapshot, WalkCorpus};

#[derive(Parser)]
#[command(about = "Node embeddings from random walks (skip-gram, in-batch negatives)", long_about = None)]
struct Options {
    /// Read walks from FILE, one per line, node ids separated by whitespace
    #[arg(long = "walks", value_name = "FILE")]
    walks_file: PathBuf,

    /// Use FILE to save the resulting node vectors
    #[arg(long = "output", value_name = "FILE")]
    output_file: PathBuf,

    /// Set size of node vectors
    #[arg(long = "size", default_value_t = 128)]
    dim: usize,

    /// Set max skip length between nodes of a walk
    #[arg(long, default_value_t = 5)]
    window: usize,

    /// Number of in-batch negative draws per walk (0 = not used)
    #[arg(long, default_value_t = 1)]
    negative: usize,

    /// Weight of the negative-pair gradient relative to positive pairs
    #[arg(long = "neg-weight", default_value_t = 1.0)]
    neg_weight: real,

    /// Walks per training step
    #[arg(long = "batch-size", default_value_t = 128)]
    batch_size: usize,

    /// Set the starting learning rate
    #[arg(long, default_value_t = 0.2)]
    alpha: real,

    /// Number of passes over the walks
    #[arg(long, default_value_t = 1)]
    iter: usize,

    /// Use N worker threads
    #[arg(long = "threads", value_name = "N", default_value_t = 4)]
    num_threads: usize,

    /// Seed for initialisation and negative shuffles
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Stage gradients in a separate host buffer before applying them
    #[arg(long)]
    mix: bool,

    /// Save the resulting vectors in binary mode
    #[arg(long, group = "format")]
    binary: bool,

    /// Save both matrices, the configuration and node ids in bincode format
    #[arg(long, group = "format")]
    bincode: bool,

    /// Continue training from a snapshot saved with --bincode
    #[arg(long, value_name = "FILE")]
    resume: Option<PathBuf>,

    /// Hide the progress bar
    #[arg(long)]
    quiet: bool,
}

struct Trainer {
    options: Options,
    corpus: WalkCorpus,
    /// Walks processed so far, across all workers and epochs.
    walks_done: AtomicU64,
    progress: ProgressBar,
}

impl Trainer {
    fn new(options: Options) -> Result<Self> {
        let corpus = WalkCorpus::load(&options.walks_file)?;
        let total = (corpus.num_walks() * options.iter) as u64;
        let progress = if options.quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(total)
        };
        progress.set_style(
            ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} walks {msg}")
                .context("bad progress template")?,
        );
        Ok(Trainer {
            options,
            corpus,
            walks_done: AtomicU64::new(0),
            progress,
        })
    }

    fn model_config(&self) -> ModelConfig {
        ModelConfig {
            dim: self.options.dim,
            vocab_size: self.corpus.vocab_size(),
            walk_length: self.corpus.walk_length(),
            window_size: self.options.window,
            negative: self.options.negative,
            neg_weight: self.options.neg_weight,
            batch_size: self.options.batch_size,
            placement: if self.options.mix {
                Placement::Mixed
            } else {
                Placement::Host
            },
        }
    }

    /// Learning rate decays linearly with overall progress, never below
    /// `alpha * 0.0001`.
    fn learning_rate(&self) -> real {
        let total = (self.corpus.num_walks() * self.options.iter) as real + 1.0;
        let done = self.walks_done.load(Ordering::Relaxed) as real;
        self.options.alpha * (1.0 - done / total).max(0.0001)
    }

    /// Train on walks `start..end` for every epoch.
    fn train_thread(&self, mut model: SkipGramModel, start: usize, end: usize) -> Result<()> {
        let walks = self.corpus.slice(start, end);
        for _epoch in 0..self.options.iter {
            for batch in walks.chunks(self.options.batch_size) {
                let lr = self.learning_rate();
                model.step(batch, lr)?;
                self.walks_done
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                self.progress.inc(batch.len() as u64);
                self.progress.set_message(format!("alpha {lr:.6}"));
            }
        }
        Ok(())
    }

    fn init_model(&self) -> Result<SkipGramModel> {
        let config = self.model_config();
        let Some(path) = &self.options.resume else {
            return SkipGramModel::new(config, self.options.seed);
        };
        let snapshot = Snapshot::load(path)?;
        anyhow::ensure!(
            snapshot.node_ids == self.corpus.node_ids(),
            "snapshot {} was trained on a different set of nodes",
            path.display()
        );
        log::info!("resuming from {}", path.display());
        SkipGramModel::with_store(config, snapshot.to_store()?, self.options.seed)
    }

    fn train_model(&self) -> Result<()> {
        let mut model = self.init_model()?;
        model.enable_shared()?;

        let num_threads = self.options.num_threads.max(1);
        let num_walks = self.corpus.num_walks();
        let workers = (0..num_threads)
            .map(|id| {
                let start = num_walks * id / num_threads;
                let end = num_walks * (id + 1) / num_threads;
                Ok((model.worker(self.options.seed + 1 + id as u64)?, start, end))
            })
            .collect::<Result<Vec<_>>>()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .context("failed to start worker threads")?;
        let start = Instant::now();
        pool.install(|| {
            workers
                .into_par_iter()
                .try_for_each(|(worker, start, end)| self.train_thread(worker, start, end))
        })?;
        self.progress.finish();
        log::info!(
            "trained {} epochs over {num_walks} walks in {:?}",
            self.options.iter,
            start.elapsed()
        );

        self.save_output(&model)
    }

    fn save_output(&self, model: &SkipGramModel) -> Result<()> {
        let path = &self.options.output_file;
        let node_ids = self.corpus.node_ids();
        if self.options.bincode {
            return Snapshot::capture(model.config(), model.store(), node_ids)?.save(path);
        }
        let mut fo = BufWriter::new(File::create(path).context("error creating output file")?);
        if self.options.binary {
            write_binary(&mut fo, model.store(), node_ids)?;
        } else {
            write_text(&mut fo, model.store(), node_ids)?;
        }
        log::info!("saved {} vectors to {}", node_ids.len(), path.display());
        Ok(())
    }
}

fn run(options: Options) -> Result<()> {
    let trainer = Trainer::new(options)?;
    trainer.train_model()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let options = Options::parse();
    if let Err(err) = run(options) {
        eprintln!("{err:#}");
        process::exit(1);
    }
}
