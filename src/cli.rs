use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Image embedding database and similarity search", long_about = None)]
pub struct Args {
    /// Override the embedding model from config.yaml
    #[clap(long, global = true)]
    pub model: Option<String>,

    /// Override the database directory from config.yaml
    #[clap(long, global = true)]
    pub embeddings_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Rebuild the embedding database from a labeled dataset.
    ///
    /// Every subdirectory of DATASET is a category, every file inside it an item.
    Build {
        dataset: PathBuf,

        /// Number of embedding workers (defaults to embedding_parallelism)
        #[clap(short, long)]
        parallelism: Option<usize>,

        /// Don't draw a progress bar
        #[clap(long, default_value = "false")]
        no_progress: bool,
    },

    /// Find the stored images most similar to a query
    Query {
        /// Query image
        #[clap(required_unless_present = "vector", conflicts_with = "vector")]
        image: Option<PathBuf>,

        /// Query with a raw embedding, comma separated
        #[clap(long, value_delimiter = ',', allow_hyphen_values = true)]
        vector: Option<Vec<f32>>,

        /// Number of results (defaults to top_k)
        #[clap(short, long)]
        k: Option<usize>,

        /// Print results as JSON
        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// Predict the class of an image with the model's own head
    Classify {
        image: PathBuf,

        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// Show item counts per persisted category
    Stats {
        #[clap(long, default_value = "false")]
        json: bool,
    },
}
