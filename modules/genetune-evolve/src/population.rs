//! PopulationManager: ranking, elitist selection and offspring generation.

use std::cmp::Ordering;

use rand::seq::index;
use rand::Rng;

use genetune_common::{EvolutionConfig, Gene, Genome};

use crate::space::GenomeSpace;

/// Genetic operators. Holds only operator rates; the engine owns the population.
#[derive(Debug, Clone)]
pub struct PopulationManager {
    crossover_prob: f64,
    mutation_rate: f64,
}

impl PopulationManager {
    pub fn new(crossover_prob: f64, mutation_rate: f64) -> Self {
        Self {
            crossover_prob: crossover_prob.clamp(0.0, 1.0),
            mutation_rate: mutation_rate.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &EvolutionConfig) -> Self {
        Self::new(config.crossover_prob, config.mutation_rate)
    }

    /// Sort best first. Unscored genomes rank last; ties break on id so the
    /// order is deterministic.
    pub fn rank(population: &mut [Genome]) {
        population.sort_by(compare_genomes);
    }

    /// Keep the top `survivors` genomes, cached fitness included.
    pub fn select(&self, mut population: Vec<Genome>, survivors: usize) -> Vec<Genome> {
        Self::rank(&mut population);
        population.truncate(survivors);
        population
    }

    /// Grow `survivors` back to `population_size`.
    ///
    /// Survivors are carried over unchanged. Every offspring gets a fresh id,
    /// is tagged with `generation`, and has passed through the space's repair.
    pub fn reproduce<R: Rng>(
        &self,
        survivors: &[Genome],
        population_size: usize,
        generation: u32,
        space: &GenomeSpace,
        rng: &mut R,
    ) -> Vec<Genome> {
        let mut ranked = survivors.to_vec();
        Self::rank(&mut ranked);
        ranked.truncate(population_size);

        let mut next = ranked.clone();
        while next.len() < population_size {
            let child = if ranked.is_empty() {
                space.sample(generation, rng)
            } else if ranked.len() >= 2 && rng.random_bool(self.crossover_prob) {
                let a = tournament(&ranked, rng);
                let b = tournament(&ranked, rng);
                self.crossover(a, b, generation, space, rng)
            } else {
                let parent = tournament(&ranked, rng);
                self.mutate(parent, generation, space, rng)
            };
            next.push(child);
        }
        next
    }

    /// Per gene: inherit from either parent, or for continuous genes take the
    /// midpoint half the time.
    pub fn crossover<R: Rng>(
        &self,
        a: &Genome,
        b: &Genome,
        generation: u32,
        space: &GenomeSpace,
        rng: &mut R,
    ) -> Genome {
        let (pa, pb) = (a.params(), b.params());
        let mut params = pa.clone();
        for gene in Gene::ALL {
            if gene.is_continuous() && rng.random_bool(0.5) {
                match gene {
                    Gene::Temperature => params.temperature = (pa.temperature + pb.temperature) / 2.0,
                    Gene::TopP => params.top_p = (pa.top_p + pb.top_p) / 2.0,
                    _ => {}
                }
            } else if rng.random_bool(0.5) {
                params.inherit(gene, pb);
            }
        }

        let child = Genome::child(params, generation, vec![a.id.clone(), b.id.clone()]);
        space.repair(child, rng)
    }

    /// Perturb one tunable gene, then each other tunable gene with
    /// probability `mutation_rate`.
    pub fn mutate<R: Rng>(
        &self,
        parent: &Genome,
        generation: u32,
        space: &GenomeSpace,
        rng: &mut R,
    ) -> Genome {
        let mut params = parent.params().clone();
        let tunable = space.tunable_genes();
        if !tunable.is_empty() {
            let forced = rng.random_range(0..tunable.len());
            for (i, gene) in tunable.iter().enumerate() {
                if i == forced || rng.random_bool(self.mutation_rate) {
                    space.mutate_gene(&mut params, *gene, rng);
                }
            }
        }

        let child = Genome::child(params, generation, vec![parent.id.clone()]);
        space.repair(child, rng)
    }
}

fn compare_genomes(a: &Genome, b: &Genome) -> Ordering {
    match (a.fitness_total(), b.fitness_total()) {
        (Some(fa), Some(fb)) => fb.total_cmp(&fa),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.id.cmp(&b.id))
}

/// Binary tournament over a ranked slice: draw two distinct entrants, the
/// better-ranked one wins.
fn tournament<'a, R: Rng>(ranked: &'a [Genome], rng: &mut R) -> &'a Genome {
    if ranked.len() < 2 {
        return &ranked[0];
    }
    let picks = index::sample(rng, ranked.len(), 2);
    &ranked[picks.index(0).min(picks.index(1))]
}
