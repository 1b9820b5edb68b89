//! Solver configuration.
//!
//! Configuration comes from built-in defaults, optionally overridden by a YAML
//! document, then by environment variables:
//!
//! | Variable                      | Field                 |
//! |-------------------------------|-----------------------|
//! | `TROTTER_BACKEND`             | `backend`             |
//! | `TROTTER_BLOCK_WIDTH`         | `block_width`         |
//! | `TROTTER_BLOCK_HEIGHT`        | `block_height`        |
//! | `TROTTER_EXCHANGE_TIMEOUT_MS` | `exchange_timeout_ms` |

use std::{ env, path::Path, time::Duration };
use serde::{ Deserialize, Serialize };
use tracing::warn;
use crate::{
    comm::Communicator,
    error::ConfigError,
    kernel::{ Backend, blocks::BlockShape },
    lattice::{ Grid, LatticeDescriptor },
};

pub type CfgResult<T> = Result<T, ConfigError>;

/// Default block extent along either axis.
pub const DEF_BLOCK: usize = 128;

/// Default halo width.
pub const DEF_HALO: usize = 4;

/// Default halo width in a rotating frame.
pub const DEF_HALO_ROTATING: usize = 8;

/// Sites one step can carry information across along either axis.
pub const STEP_REACH: usize = 2;

/// Sites one rotating-frame step can carry information across.
pub const STEP_REACH_ROTATING: usize = 6;

/// Everything about a run that is not the Hamiltonian or the initial state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub grid: Grid,
    pub backend: Backend,
    pub delta_t: f64,
    /// Halo width; [`DEF_HALO`] or [`DEF_HALO_ROTATING`] if unset.
    pub halo: Option<usize>,
    pub block_width: usize,
    pub block_height: usize,
    /// Time allowed for any single halo message to arrive.
    pub exchange_timeout_ms: u64,
    /// Explicit `[x, y]` process grid.
    pub process_grid: Option<[usize; 2]>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            grid: Grid::default(),
            backend: Backend::default(),
            delta_t: 1e-3,
            halo: None,
            block_width: DEF_BLOCK,
            block_height: DEF_BLOCK,
            exchange_timeout_ms: 60_000,
            process_grid: None,
        }
    }
}

impl SolverConfig {
    pub fn new(grid: Grid, delta_t: f64) -> Self {
        Self { grid, delta_t, ..Self::default() }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_blocks(mut self, width: usize, height: usize) -> Self {
        self.block_width = width;
        self.block_height = height;
        self
    }

    pub fn with_halo(mut self, halo: usize) -> Self {
        self.halo = Some(halo);
        self
    }

    pub fn with_process_grid(mut self, grid: [usize; 2]) -> Self {
        self.process_grid = Some(grid);
        self
    }

    /// Parse a YAML document; missing fields take their defaults.
    pub fn from_yaml_str(s: &str) -> CfgResult<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// Read a YAML file and apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> CfgResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `TROTTER_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> CfgResult<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> CfgResult<()>
    where F: Fn(&str) -> Option<String>
    {
        fn parse<T: std::str::FromStr>(key: &'static str, val: String) -> CfgResult<T> {
            val.trim().parse().map_err(|_| ConfigError::BadEnv(key, val))
        }

        if let Some(val) = lookup("TROTTER_BACKEND") {
            self.backend = val.parse()?;
        }
        if let Some(val) = lookup("TROTTER_BLOCK_WIDTH") {
            self.block_width = parse("TROTTER_BLOCK_WIDTH", val)?;
        }
        if let Some(val) = lookup("TROTTER_BLOCK_HEIGHT") {
            self.block_height = parse("TROTTER_BLOCK_HEIGHT", val)?;
        }
        if let Some(val) = lookup("TROTTER_EXCHANGE_TIMEOUT_MS") {
            self.exchange_timeout_ms = parse("TROTTER_EXCHANGE_TIMEOUT_MS", val)?;
        }
        Ok(())
    }

    /// Halo width in use, depending on whether the frame rotates.
    pub fn halo_width(&self, rotating: bool) -> usize {
        self.halo.unwrap_or(if rotating { DEF_HALO_ROTATING } else { DEF_HALO })
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    /// Check the time step, halo and blocks.
    pub fn validate(&self, rotating: bool) -> CfgResult<()> {
        ConfigError::check_time_step(self.delta_t)?;
        let halo = self.halo_width(rotating);
        let reach = if rotating { STEP_REACH_ROTATING } else { STEP_REACH };
        if halo < reach {
            return Err(ConfigError::NarrowHalo { halo, reach });
        }
        for (axis, block) in [('x', self.block_width), ('y', self.block_height)] {
            if block % 2 != 0 || block <= 2 * halo {
                return Err(ConfigError::BadBlock { axis, block, halo });
            }
        }
        if self.exchange_timeout_ms == 0 {
            warn!("exchange timeout is zero; every halo receive will time out");
        }
        Ok(())
    }

    /// Block extents, overlapping by the halo width.
    pub fn block_shape(&self, rotating: bool) -> BlockShape {
        let halo = self.halo_width(rotating);
        BlockShape {
            width: self.block_width,
            height: self.block_height,
            margin_x: halo,
            margin_y: halo,
        }
    }

    /// Describe the tile of `comm`'s rank.
    pub fn lattice(&self, comm: &dyn Communicator, rotating: bool)
        -> CfgResult<LatticeDescriptor>
    {
        Ok(LatticeDescriptor::new(
            &self.grid,
            self.halo_width(rotating),
            comm.rank(),
            comm.size(),
            self.process_grid,
        )?)
    }
}
