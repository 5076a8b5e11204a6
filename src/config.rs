use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default image model (CLIP ViT-B/32 produces 512-dim embeddings)
const DEFAULT_MODEL: &str = "clip-vit-b-32";
/// Default input edge length in pixels
const DEFAULT_IMAGE_SIZE: u32 = 224;
/// Default number of results per query
const DEFAULT_TOP_K: usize = 5;

const CONFIG_FILE_NAME: &str = "config.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("invalid config value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Embedding model name (e.g., "clip-vit-b-32")
    #[serde(default = "default_model")]
    pub model: String,

    /// Edge length every image is resized to before embedding
    #[serde(default = "default_image_size")]
    pub image_size: u32,

    /// Parallelism for embedding generation: "auto" or a positive integer
    #[serde(default = "default_embedding_parallelism")]
    pub embedding_parallelism: String,

    /// Number of results returned by a query unless overridden
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Where category files live (defaults to `<base>/embeddings`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings_dir: Option<PathBuf>,

    /// Where model weights are cached (defaults to `<base>/models`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_dir: Option<PathBuf>,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            image_size: DEFAULT_IMAGE_SIZE,
            embedding_parallelism: default_embedding_parallelism(),
            top_k: DEFAULT_TOP_K,
            embeddings_dir: None,
            models_dir: None,
            base_path: PathBuf::new(),
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_image_size() -> u32 {
    DEFAULT_IMAGE_SIZE
}

fn default_embedding_parallelism() -> String {
    "auto".to_string()
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

/// Base directory from `ORION_BASE_PATH`, else `~/.local/share/orion`.
pub fn default_base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("ORION_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = homedir::my_home()?
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(home.join(".local").join("share").join("orion"))
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "model",
                message: "must not be empty".to_string(),
            });
        }

        if self.image_size == 0 {
            return Err(ConfigError::Invalid {
                field: "image_size",
                message: "must be greater than 0".to_string(),
            });
        }

        if self.top_k == 0 {
            return Err(ConfigError::Invalid {
                field: "top_k",
                message: "must be greater than 0".to_string(),
            });
        }

        // validate embedding_parallelism: "auto" or positive integer
        if self.embedding_parallelism != "auto" {
            match self.embedding_parallelism.parse::<usize>() {
                Ok(n) if n > 0 => {}
                _ => {
                    return Err(ConfigError::Invalid {
                        field: "embedding_parallelism",
                        message: format!(
                            "must be 'auto' or a positive integer, got '{}'",
                            self.embedding_parallelism
                        ),
                    })
                }
            }
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults if absent.
    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(base_path)?;
        let config_path = base_path.join(CONFIG_FILE_NAME);

        // create new if does not exist
        if !config_path.exists() {
            std::fs::write(&config_path, serde_yml::to_string(&Self::default())?)?;
        }

        let config_str = std::fs::read_to_string(&config_path)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(self.base_path.join(CONFIG_FILE_NAME), config_str)?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn embeddings_dir(&self) -> PathBuf {
        self.embeddings_dir
            .clone()
            .unwrap_or_else(|| self.base_path.join("embeddings"))
    }

    pub fn models_dir(&self) -> PathBuf {
        self.models_dir
            .clone()
            .unwrap_or_else(|| self.base_path.join("models"))
    }

    /// Resolved worker count for embedding generation.
    pub fn parallelism(&self) -> usize {
        match self.embedding_parallelism.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}
