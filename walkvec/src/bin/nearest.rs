use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;

use walkvec::Vectors;

#[derive(Parser)]
#[command(about = "Print the nodes closest to a query node in a text embedding file")]
struct Options {
    /// Contains node vectors in the TEXT FORMAT written by `walkvec`.
    #[arg(value_name = "FILE")]
    file_name: PathBuf,

    /// Number of closest nodes that will be shown
    #[arg(short = 'n', default_value_t = 40)]
    count: usize,
}

fn run(options: Options) -> Result<()> {
    let vectors = Vectors::load_text(&options.file_name)?;
    log::info!(
        "loaded {} vectors of size {}",
        vectors.num_nodes(),
        vectors.size()
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("Enter node ids (EXIT to break): ");
        stdout.flush().context("error writing to stdout")?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).context("error reading stdin")? == 0 {
            break;
        }
        let line = line.trim();
        if line == "EXIT" {
            break;
        }

        let mut query = vec![];
        for id in line.split_whitespace() {
            match vectors.lookup(id) {
                Some(node) => query.push(node),
                None => println!("Out of vocabulary node: {id}"),
            }
        }
        if query.is_empty() {
            continue;
        }

        println!("{:>50}       Cosine similarity", "Node");
        println!("{}", "-".repeat(72));
        for (node, similarity) in vectors.nearest(&query, options.count) {
            println!("{:>50}\t\t{similarity}", vectors.id(node));
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();

    let options = Options::parse();
    if let Err(err) = run(options) {
        eprintln!("{err:#}");
        process::exit(1);
    }
}
