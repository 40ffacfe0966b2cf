
use crate::cluster_engine::{ClusterConfig, ClusterResult, cluster_observations};
use crate::data_types::records::{ClusterAssignment, FrequencyRecord, ReadAssignment};
use crate::data_types::strain_map::StrainMap;
use crate::featurizer::compute_frequencies;
use crate::strain_reconciler::reconcile_strains;
use crate::table_assembler::{AssembledTables, assemble_tables};

use log::{debug, info, warn};
use simple_error::bail;
use std::path::PathBuf;

/// Everything needed to infer strains from a floria output folder
#[derive(Clone, Debug)]
pub struct StrainerConfig {
    /// the floria output folder
    pub floria_outdir: PathBuf,
    /// number of strains to cluster into; 0 uses the ploidy summary
    pub nb_strains: usize,
    /// minimum HAPQ for a haploset to be used
    pub hapq_cut: u32,
    /// minimum posterior probability for an observation to vote on a strain
    pub probability_cut: f64,
    /// seed for the mixture model
    pub seed: u64,
    /// number of contigs to parse in parallel
    pub threads: usize
}

/// The result of strain inference
#[derive(Clone, Debug)]
pub struct StrainInference {
    /// haploset to strain assignments
    pub strain_map: StrainMap,
    /// sorted distinct strain ids
    pub strains: Vec<usize>,
    /// read to haploset assignments for confident haplosets
    pub read_assignment: ReadAssignment,
    /// the number of mixture components that was used
    pub num_components: usize
}

/// Runs the full inference: load the floria tables, compute allele frequencies, cluster them, and reconcile a strain per haploset.
/// # Arguments
/// * `config` - the run configuration
/// # Errors
/// * if the floria output cannot be loaded
/// * if there are no allele frequency observations to cluster
/// * if clustering fails
pub fn infer_strains(config: &StrainerConfig) -> Result<StrainInference, Box<dyn std::error::Error>> {
    info!("Loading floria output from {:?}...", config.floria_outdir);
    let tables: AssembledTables = assemble_tables(&config.floria_outdir, config.hapq_cut, config.threads)?;

    let num_components: usize = if config.nb_strains == 0 {
        info!("Number of strains not provided, using the ploidy summary estimate of {}", tables.strain_count_hint);
        tables.strain_count_hint
    } else {
        config.nb_strains
    };

    let frequencies: Vec<FrequencyRecord> = compute_frequencies(&tables.merged, config.hapq_cut);
    if frequencies.is_empty() {
        bail!("No allele frequency observations found with HAPQ >= {}", config.hapq_cut);
    }

    let cluster_config: ClusterConfig = ClusterConfig {
        num_components,
        seed: config.seed,
        ..Default::default()
    };
    let observations: Vec<f64> = frequencies.iter().map(|f| f.freq).collect();
    info!("Clustering {} observations...", observations.len());
    let cluster_result: ClusterResult = cluster_observations(&observations, &cluster_config)?;
    debug!("Mixture means: {:?}", cluster_result.model.means());
    debug!("Mixture weights: {:?}", cluster_result.model.weights());
    if !cluster_result.model.converged() {
        warn!("Mixture model stopped after {} iterations without converging", cluster_result.model.iterations());
    }

    let assignments: Vec<ClusterAssignment> = cluster_result.assignments();
    let (strain_map, strains) = reconcile_strains(&frequencies, &assignments, config.probability_cut);
    if strain_map.is_empty() {
        warn!("No haploset passed the strain probability cutoff of {}", config.probability_cut);
    }

    Ok(StrainInference {
        strain_map,
        strains,
        read_assignment: tables.read_assignment,
        num_components: cluster_result.num_components
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(nb_strains: usize) -> StrainerConfig {
        StrainerConfig {
            floria_outdir: PathBuf::from("./test_data/floria_out"),
            nb_strains,
            hapq_cut: 15,
            probability_cut: 0.9,
            seed: 42,
            threads: 1
        }
    }

    #[test]
    fn test_infer_strains() {
        // the ploidy summary averages to 2
        let inference = infer_strains(&test_config(0)).unwrap();
        assert_eq!(inference.num_components, 2);
        assert_eq!(inference.strains, vec![0, 1]);

        // major haplosets land together, minor haplosets land together
        let strain_map = &inference.strain_map;
        let major = strain_map.strain("contig_1", "HAP0").unwrap();
        let minor = strain_map.strain("contig_1", "HAP1").unwrap();
        assert_ne!(major, minor);
        assert_eq!(strain_map.strain("contig_1", "HAP3"), Some(major));
        assert_eq!(strain_map.strain("contig_1", "HAP4"), Some(minor));
        assert_eq!(strain_map.strain("contig_2", "HAP0"), Some(major));
        assert_eq!(strain_map.strain("contig_2", "HAP1"), Some(minor));

        // HAP2 is below the HAPQ cutoff
        assert_eq!(strain_map.strain("contig_1", "HAP2"), None);
        assert_eq!(inference.read_assignment.haploset("contig_1", "c1_read_6"), None);

        for (_, _, strain) in strain_map.sorted_entries() {
            assert!(inference.strains.contains(&strain));
        }
    }

    #[test]
    fn test_infer_strains_deterministic() {
        let first = infer_strains(&test_config(2)).unwrap();
        let second = infer_strains(&test_config(2)).unwrap();
        assert_eq!(first.strain_map, second.strain_map);
        assert_eq!(first.strains, second.strains);

        let mut threaded_config = test_config(2);
        threaded_config.threads = 2;
        let threaded = infer_strains(&threaded_config).unwrap();
        assert_eq!(first.strain_map, threaded.strain_map);
    }

    #[test]
    fn test_infer_strains_rejects_one() {
        assert!(infer_strains(&test_config(1)).is_err());
    }

    #[test]
    fn test_infer_strains_nothing_confident() {
        let mut config = test_config(2);
        config.hapq_cut = 1000;
        assert!(infer_strains(&config).is_err());
    }
}
