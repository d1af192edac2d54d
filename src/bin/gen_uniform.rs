use clap::Parser;
use rand::distributions::{Distribution, Uniform};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Generate uniform(-0.01, 0.01) samples, one per line, for reproducible
/// factor initialization via a task's distribution_file.
#[derive(Parser)]
#[command(version, about = "wals init-file generator")]
struct Opts {
    /// Number of samples to write
    #[arg(default_value_t = 1_000_000)]
    count: usize,
    /// Output file
    #[arg(long, default_value = "uniform.dat")]
    out: PathBuf,
}

fn main() -> std::io::Result<()> {
    let opts = Opts::parse();
    let mut rng = rand::thread_rng();
    let distr = Uniform::new(-0.01, 0.01);

    let mut out = BufWriter::new(File::create(&opts.out)?);
    for _ in 0..opts.count {
        writeln!(out, "{:.9}", distr.sample(&mut rng))?;
    }
    out.flush()
}
