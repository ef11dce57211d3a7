// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Semirings and a Kleene fixpoint driver.
//!
//! The trait models exactly what path problems need: `combine` joins
//! alternatives, `extend` concatenates, `star` closes a self-loop. Marker
//! constants let generic code shortcut when the structure is idempotent or
//! commutative. Implementations are plain newtypes; the fixpoint driver is
//! generic over the trait and knows nothing about the instances.

pub trait Semiring: Clone + PartialEq {
    const IDEMPOTENT: bool;
    const COMMUTATIVE: bool;

    fn zero() -> Self;
    fn one() -> Self;

    /// Choice between alternatives (`+`).
    fn combine(&self, other: &Self) -> Self;

    /// Sequencing (`*`).
    fn extend(&self, other: &Self) -> Self;

    /// Closure of a self-loop: `1 + a + a*a + ...`.
    fn star(&self) -> Self;

    /// The difference used by differential solvers; idempotent structures
    /// default to returning `self`.
    fn subtract(&self, other: &Self) -> Self {
        let _ = other;
        self.clone()
    }
}

/// Reachability.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BoolSemiring(pub bool);

impl Semiring for BoolSemiring {
    const IDEMPOTENT: bool = true;
    const COMMUTATIVE: bool = true;

    fn zero() -> Self {
        BoolSemiring(false)
    }

    fn one() -> Self {
        BoolSemiring(true)
    }

    fn combine(&self, other: &Self) -> Self {
        BoolSemiring(self.0 || other.0)
    }

    fn extend(&self, other: &Self) -> Self {
        BoolSemiring(self.0 && other.0)
    }

    fn star(&self) -> Self {
        BoolSemiring(true)
    }
}

/// Shortest paths: `combine` is min, `extend` is saturating addition,
/// `zero` is unreachable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TropicalSemiring(pub u64);

impl TropicalSemiring {
    pub const INFINITY: u64 = u64::MAX;
}

impl Semiring for TropicalSemiring {
    const IDEMPOTENT: bool = true;
    const COMMUTATIVE: bool = true;

    fn zero() -> Self {
        TropicalSemiring(Self::INFINITY)
    }

    fn one() -> Self {
        TropicalSemiring(0)
    }

    fn combine(&self, other: &Self) -> Self {
        TropicalSemiring(self.0.min(other.0))
    }

    fn extend(&self, other: &Self) -> Self {
        TropicalSemiring(self.0.saturating_add(other.0))
    }

    fn star(&self) -> Self {
        // Nonnegative weights: looping never shortens a path.
        TropicalSemiring(0)
    }
}

/// Maximum capacity / bottleneck paths: `combine` is max, `extend` is min.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MaxMinSemiring(pub u64);

impl Semiring for MaxMinSemiring {
    const IDEMPOTENT: bool = true;
    const COMMUTATIVE: bool = true;

    fn zero() -> Self {
        MaxMinSemiring(0)
    }

    fn one() -> Self {
        MaxMinSemiring(u64::MAX)
    }

    fn combine(&self, other: &Self) -> Self {
        MaxMinSemiring(self.0.max(other.0))
    }

    fn extend(&self, other: &Self) -> Self {
        MaxMinSemiring(self.0.min(other.0))
    }

    fn star(&self) -> Self {
        Self::one()
    }
}

/// A linear system `x_i = b_i + sum_j a_ij * x_j` over any semiring.
pub struct LinearSystem<S> {
    pub coefficients: Vec<Vec<(usize, S)>>,
    pub constants: Vec<S>,
}

/// Kleene iteration to the least fixpoint. Idempotent structures converge
/// in at most `n` rounds; the bound covers the general case.
pub fn kleene_solve<S: Semiring>(system: &LinearSystem<S>, max_rounds: usize) -> Vec<S> {
    let n = system.constants.len();
    let mut x: Vec<S> = vec![S::zero(); n];
    for _ in 0..max_rounds {
        let mut changed = false;
        for i in 0..n {
            let mut next = system.constants[i].clone();
            for (j, a) in &system.coefficients[i] {
                next = next.combine(&a.extend(&x[*j]));
            }
            if next != x[i] {
                x[i] = next;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    x
}
