//! Random initial configurations.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::dislocation::Dislocation;
use crate::error::{Result, SimulationError};

/// Default seed of the generator.
pub const DEFAULT_SEED: u64 = 1000;

/// `count` dislocations placed uniformly in the unit cell, with alternating
/// Burgers values starting at -1.
///
/// Unless `sorted` is false the result is ordered by `y + b`, largest first,
/// so the positive dislocations come first.
pub fn generate_configuration(count: usize, seed: u64, sorted: bool) -> Result<Vec<Dislocation>> {
    if count % 2 != 0 {
        return Err(SimulationError::InvalidSettings(format!(
            "the dislocation count must be even, got {count}"
        )));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut dislocations: Vec<Dislocation> = (0..count)
        .map(|i| {
            let x = rng.random_range(-0.5..0.5);
            let y = rng.random_range(-0.5..0.5);
            let b = if i % 2 == 0 { -1.0 } else { 1.0 };
            Dislocation::new(x, y, b)
        })
        .collect();
    if sorted {
        dislocations.sort_by(|a, b| (b.y + b.b).total_cmp(&(a.y + a.b)));
    }
    Ok(dislocations)
}

/// `ic_<seed>_<count>.txt`, or `ic_<seed>.txt` when `bare`.
pub fn configuration_file_name(seed: u64, count: usize, bare: bool) -> String {
    if bare {
        format!("ic_{seed}.txt")
    } else {
        format!("ic_{seed}_{count}.txt")
    }
}
