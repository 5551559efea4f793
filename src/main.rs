mod backend;
mod controller;
mod emitter;
mod gpu;
mod grid;
mod pile;

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use backend::PileBackend;
use controller::{ControllerConfig, DoublingController, RunLimits, StopReason};
use emitter::{AsyncEmitter, Emitter, PngEmitter, PpmEmitter};
use grid::{Grid, Kernel};
use pile::CpuPile;

/// Run configuration (can be loaded from YAML)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Compute backend: "gpu" or "cpu"
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Grid dimensions
    pub grid: GridConfig,
    /// Pile parameters
    pub pile: PileConfig,
    /// Output settings
    pub output: OutputConfig,
    /// Run limits
    pub limits: LimitsConfig,
}

fn default_backend() -> String {
    "cpu".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub width: usize,
    pub height: usize,
}

/// An explicit seed placement: `grains` dropped on cell (y, x).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedCell {
    pub y: usize,
    pub x: usize,
    pub grains: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PileConfig {
    /// Grains dropped on the center cell when `seeds` is empty.
    pub base_size: u64,
    /// Doubling epochs after the first stabilization (0 = single run).
    pub doublings: u32,
    /// Uniform grain count added to every cell before seeding.
    pub background: u64,
    /// Toppling kernel: "von_neumann" or "hexagonal"
    pub kernel: String,
    /// Explicit seed placements; empty means one center seed of base_size.
    pub seeds: Vec<SeedCell>,
    /// Per-channel RGB multipliers for rendering.
    pub colour: [u8; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Toppling steps between snapshots and stability checks.
    pub batch_iterations: usize,
    pub frames_dir: String,
    /// Frame format: "png" (compressed) or "ppm" (uncompressed)
    pub frame_format: String,
    /// Encode and write frames on a background thread (non-blocking)
    pub async_emit: bool,
    /// Abort the run on a frame write failure instead of continuing
    pub abort_on_emit_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Stop after N batches across the whole run (0 = unbounded)
    pub max_batches: u64,
    /// Stop after N seconds of wall-clock time (0 = unbounded)
    pub timeout_secs: u64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self { width: 511, height: 511 }
    }
}

impl Default for PileConfig {
    fn default() -> Self {
        Self {
            base_size: 1 << 14,
            doublings: 0,
            background: 0,
            kernel: "von_neumann".to_string(),
            seeds: Vec::new(),
            colour: [102, 182, 65],
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            batch_iterations: 1024,
            frames_dir: "frames".to_string(),
            frame_format: "png".to_string(),
            async_emit: true,
            abort_on_emit_error: false,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_batches: 0, timeout_secs: 0 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            grid: GridConfig::default(),
            pile: PileConfig::default(),
            output: OutputConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a YAML file
    pub fn from_yaml(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Save config to a YAML file
    pub fn to_yaml(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Generate a template config file
    pub fn write_template(path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let config = Config::default();
        config.to_yaml(path)
    }

    /// The largest grain count any cell can hold at the start of an epoch:
    /// after `doublings` doublings of (background + the heaviest seed).
    fn peak_cell_value(&self) -> Option<u128> {
        let heaviest = if self.pile.seeds.is_empty() {
            self.pile.base_size
        } else {
            self.pile.seeds.iter().map(|s| s.grains).max().unwrap_or(0)
        };
        let start = self.pile.background as u128 + heaviest as u128;
        if self.pile.doublings > 100 {
            return None;
        }
        start.checked_mul(1u128 << self.pile.doublings)
    }

    /// Validate configuration and return warnings.
    /// Returns Err if there are fatal configuration errors.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if self.grid.width == 0 || self.grid.height == 0 {
            return Err("Grid dimensions must be non-zero".to_string());
        }

        let kernel = Kernel::from_name(&self.pile.kernel)?;

        match self.backend.as_str() {
            "cpu" | "gpu" => {}
            other => {
                return Err(format!("unknown backend '{}' (expected 'cpu' or 'gpu')", other));
            }
        }

        match self.output.frame_format.as_str() {
            "png" | "ppm" => {}
            other => {
                return Err(format!(
                    "unknown frame_format '{}' (expected 'png' or 'ppm')",
                    other
                ));
            }
        }

        if self.output.batch_iterations == 0 {
            warnings.push("batch_iterations is 0, will be treated as 1".to_string());
        }

        for (i, seed) in self.pile.seeds.iter().enumerate() {
            if seed.y >= self.grid.height || seed.x >= self.grid.width {
                return Err(format!(
                    "seeds[{}] at ({}, {}) is outside the {}x{} grid",
                    i, seed.y, seed.x, self.grid.height, self.grid.width
                ));
            }
        }

        if self.pile.seeds.is_empty() && self.pile.base_size == 0 && self.pile.background == 0 {
            warnings.push("pile is empty: no seeds, base_size 0, background 0".to_string());
        }

        // Toppling reads a cell's full value before splitting it, so storage
        // must hold threshold * (largest starting cell) without wrapping.
        // Checked up front so an impossible run fails before any work.
        let cell_limit: u128 = match self.backend.as_str() {
            "gpu" => u32::MAX as u128,
            _ => u64::MAX as u128,
        };
        let peak = self
            .peak_cell_value()
            .ok_or_else(|| "doublings overflow the capacity check".to_string())?;
        match peak.checked_mul(kernel.threshold() as u128) {
            Some(worst) if worst <= cell_limit => {}
            _ => {
                return Err(format!(
                    "peak cell value {} x threshold {} exceeds the {} backend's cell capacity",
                    peak,
                    kernel.threshold(),
                    self.backend
                ));
            }
        }

        if self.grid.width % 2 == 0 || self.grid.height % 2 == 0 {
            warnings.push(
                "even grid dimension: the default center seed will sit off-center".to_string(),
            );
        }

        Ok(warnings)
    }
}

/// Parsed command line: the effective config plus special modes.
struct Args {
    config: Config,
    generate_config: Option<String>,
}

fn parse_args() -> Args {
    let argv: Vec<String> = env::args().collect();
    let mut config = Config::default();
    let mut generate_config = None;

    // First pass: check for --config or --generate-config
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let config_path = &argv[i];
                match Config::from_yaml(config_path) {
                    Ok(loaded) => {
                        println!("Loaded config from: {}", config_path);
                        config = loaded;
                    }
                    Err(e) => {
                        eprintln!("Error loading config file '{}': {}", config_path, e);
                        std::process::exit(1);
                    }
                }
            }
            "--generate-config" => {
                i += 1;
                let output_path = if i < argv.len() && !argv[i].starts_with('-') {
                    argv[i].clone()
                } else {
                    "config.yaml".to_string()
                };
                generate_config = Some(output_path);
            }
            _ => {}
        }
        i += 1;
    }

    // Second pass: CLI args override config file values
    i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" | "-c" | "--generate-config" => {
                i += 1; // skip, already processed
            }
            "--backend" | "-b" => {
                i += 1;
                config.backend = argv[i].clone();
            }
            "--width" | "-w" => {
                i += 1;
                config.grid.width = argv[i].parse().expect("Invalid width");
            }
            "--height" | "-h" => {
                i += 1;
                config.grid.height = argv[i].parse().expect("Invalid height");
            }
            "--base-size" | "-s" => {
                i += 1;
                config.pile.base_size = argv[i].parse().expect("Invalid base-size");
            }
            "--doublings" | "-n" => {
                i += 1;
                config.pile.doublings = argv[i].parse().expect("Invalid doublings");
            }
            "--background" => {
                i += 1;
                config.pile.background = argv[i].parse().expect("Invalid background");
            }
            "--kernel" | "-k" => {
                i += 1;
                config.pile.kernel = argv[i].clone();
            }
            "--batch-iterations" => {
                i += 1;
                config.output.batch_iterations =
                    argv[i].parse().expect("Invalid batch-iterations");
            }
            "--frames-dir" | "-d" => {
                i += 1;
                config.output.frames_dir = argv[i].clone();
            }
            "--format" | "-f" => {
                i += 1;
                config.output.frame_format = argv[i].clone();
            }
            "--async-emit" => {
                config.output.async_emit = true;
            }
            "--no-async-emit" => {
                config.output.async_emit = false;
            }
            "--max-batches" => {
                i += 1;
                config.limits.max_batches = argv[i].parse().expect("Invalid max-batches");
            }
            "--timeout-secs" => {
                i += 1;
                config.limits.timeout_secs = argv[i].parse().expect("Invalid timeout-secs");
            }
            "--help" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    Args { config, generate_config }
}

fn print_help() {
    println!("Abelian Sandpile Renderer");
    println!();
    println!("USAGE:");
    println!("    sandpile [OPTIONS]");
    println!("    sandpile --config config.yaml");
    println!("    sandpile --generate-config [output.yaml]");
    println!();
    println!("CONFIG FILE:");
    println!("    -c, --config <FILE>       Load settings from YAML config file");
    println!("    --generate-config [FILE]  Generate template config (default: config.yaml)");
    println!();
    println!("OPTIONS (override config file values):");
    println!("    -b, --backend <NAME>      Compute backend: cpu or gpu (default: cpu)");
    println!("    -w, --width <N>           Grid width (default: 511)");
    println!("    -h, --height <N>          Grid height (default: 511)");
    println!("    -s, --base-size <N>       Grains on the center cell (default: 16384)");
    println!("    -n, --doublings <N>       Doubling epochs after the first (default: 0)");
    println!("    --background <N>          Uniform starting grains per cell (default: 0)");
    println!("    -k, --kernel <NAME>       Kernel: von_neumann or hexagonal");
    println!("    --batch-iterations <N>    Steps between snapshots (default: 1024)");
    println!("    -d, --frames-dir <PATH>   Frames output directory (default: frames)");
    println!("    -f, --format <FMT>        Frame format: png or ppm (default: png)");
    println!("    --async-emit              Write frames on a background thread");
    println!("    --no-async-emit           Write frames synchronously");
    println!("    --max-batches <N>         Stop after N batches (0 = unbounded)");
    println!("    --timeout-secs <N>        Stop after N seconds (0 = unbounded)");
    println!();
    println!("    --help                    Print this help message");
}

fn build_backend(config: &Config, grid: Grid, kernel: Kernel) -> Box<dyn PileBackend> {
    if config.backend == "gpu" {
        match gpu::GpuPile::new(&grid, &kernel) {
            Some(pile) => return Box::new(pile),
            None => {
                eprintln!("Warning: no GPU adapter available, falling back to CPU");
            }
        }
    }
    Box::new(CpuPile::new(grid, kernel))
}

fn build_emitter(config: &Config) -> Result<Box<dyn Emitter>, Box<dyn std::error::Error>> {
    let inner: Box<dyn Emitter> = match config.output.frame_format.as_str() {
        "ppm" => Box::new(PpmEmitter::new(&config.output.frames_dir)?),
        _ => Box::new(PngEmitter::new(&config.output.frames_dir)?),
    };
    if config.output.async_emit {
        Ok(Box::new(AsyncEmitter::new(inner)))
    } else {
        Ok(inner)
    }
}

fn main() {
    let args = parse_args();

    if let Some(ref path) = args.generate_config {
        match Config::write_template(path) {
            Ok(_) => {
                println!("Generated config template: {}", path);
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("Error writing config template: {}", e);
                std::process::exit(1);
            }
        }
    }

    let config = args.config;
    match config.validate() {
        Ok(warnings) => {
            for warning in warnings {
                eprintln!("Config warning: {}", warning);
            }
        }
        Err(e) => {
            eprintln!("Config validation error: {}", e);
            std::process::exit(1);
        }
    }

    let kernel = match Kernel::from_name(&config.pile.kernel) {
        Ok(k) => k,
        Err(e) => {
            eprintln!("Config validation error: {}", e);
            std::process::exit(1);
        }
    };

    println!("Abelian Sandpile Renderer");
    println!("=========================\n");

    println!("Configuration:");
    println!("  Grid: {}x{} cells", config.grid.width, config.grid.height);
    println!(
        "  Kernel: {} (threshold {})",
        config.pile.kernel,
        kernel.threshold()
    );
    if config.pile.seeds.is_empty() {
        println!("  Seed: {} grains on the center cell", config.pile.base_size);
    } else {
        println!("  Seeds: {} explicit placements", config.pile.seeds.len());
    }
    if config.pile.background > 0 {
        println!("  Background: {} grains per cell", config.pile.background);
    }
    println!("  Doublings: {}", config.pile.doublings);
    println!("  Batch iterations: {}", config.output.batch_iterations);
    println!(
        "  Frames: {}/ ({}{})",
        config.output.frames_dir,
        config.output.frame_format,
        if config.output.async_emit { ", async" } else { "" }
    );
    if config.limits.max_batches > 0 {
        println!("  Max batches: {}", config.limits.max_batches);
    }
    if config.limits.timeout_secs > 0 {
        println!("  Timeout: {} s", config.limits.timeout_secs);
    }

    let seeds: Vec<(usize, usize, u64)> = config
        .pile
        .seeds
        .iter()
        .map(|s| (s.y, s.x, s.grains))
        .collect();
    let grid = Grid::seeded(
        config.grid.height,
        config.grid.width,
        config.pile.background,
        config.pile.base_size,
        &seeds,
    );

    let backend = build_backend(&config, grid, kernel);
    println!("  Backend: {}\n", backend.name());

    let mut emitter = match build_emitter(&config) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Error creating frame emitter: {}", e);
            std::process::exit(1);
        }
    };

    let limits = RunLimits {
        max_batches: config.limits.max_batches,
        timeout: match config.limits.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
    };
    let mut controller = DoublingController::new(
        backend,
        ControllerConfig {
            doublings: config.pile.doublings,
            batch_iterations: config.output.batch_iterations,
            colour: config.pile.colour,
            abort_on_emit_error: config.output.abort_on_emit_error,
        },
    );

    let summary = match controller.run(emitter.as_mut(), &limits) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Run failed: {}", e);
            std::process::exit(1);
        }
    };

    println!("\nRun complete!");
    println!(
        "  Stop reason: {}",
        match summary.stop {
            StopReason::Completed => "stabilized",
            StopReason::BatchLimit => "batch limit reached",
            StopReason::Timeout => "timeout",
        }
    );
    println!(
        "  Epochs completed: {}/{}",
        summary.epochs_completed,
        config.pile.doublings + 1
    );
    println!(
        "  Batches: {} ({} toppling steps)",
        summary.batches_run, summary.steps_run
    );
    println!("  Frames written: {}", summary.frames_written);
    if summary.frames_failed > 0 {
        println!("  Frames FAILED: {}", summary.frames_failed);
    }
    println!("  Elapsed: {:.1} s", summary.elapsed.as_secs_f64());

    if summary.stop != StopReason::Completed {
        std::process::exit(2); // terminated before stabilizing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates_clean() {
        let warnings = Config::default().validate().unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
    }

    #[test]
    fn zero_grid_dimension_rejected() {
        let mut config = Config::default();
        config.grid.width = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_kernel_rejected() {
        let mut config = Config::default();
        config.pile.kernel = "moore".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_backend_rejected() {
        let mut config = Config::default();
        config.backend = "fpga".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_bounds_seed_rejected() {
        let mut config = Config::default();
        config.pile.seeds = vec![SeedCell { y: 600, x: 0, grains: 1 }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn gpu_capacity_check_uses_u32_range() {
        let mut config = Config::default();
        config.backend = "gpu".to_string();
        // 2^30 grains doubled once, times threshold 4, busts 32 bits.
        config.pile.base_size = 1 << 30;
        config.pile.doublings = 1;
        assert!(config.validate().is_err());

        config.backend = "cpu".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn cpu_capacity_check_uses_u64_range() {
        let mut config = Config::default();
        config.pile.base_size = 1 << 60;
        config.pile.doublings = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_yaml_round_trip() {
        let path = "/tmp/sandpile_test_config.yaml";
        let mut config = Config::default();
        config.pile.doublings = 3;
        config.pile.seeds = vec![SeedCell { y: 10, x: 20, grains: 500 }];
        config.to_yaml(path).unwrap();

        let loaded = Config::from_yaml(path).unwrap();
        assert_eq!(loaded.pile.doublings, 3);
        assert_eq!(loaded.pile.seeds.len(), 1);
        assert_eq!(loaded.pile.seeds[0].grains, 500);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn even_dimensions_warn() {
        let mut config = Config::default();
        config.grid.width = 512;
        let warnings = config.validate().unwrap();
        assert!(!warnings.is_empty());
    }
}
