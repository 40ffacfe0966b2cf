
use crate::data_types::records::{ClusterAssignment, FrequencyRecord};
use crate::data_types::strain_map::StrainMap;

use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};

/// Collapses per-observation cluster labels into one strain per haploset.
/// Observations with a posterior below `probability_cut` are dropped, and each haploset gets the mean of its remaining labels, rounded half-to-even.
/// Haplosets without any remaining observation are left out of the map.
/// Returns the strain map and the sorted distinct labels that survived the filter.
/// # Arguments
/// * `frequencies` - the clustered observations
/// * `assignments` - the cluster label of each observation
/// * `probability_cut` - minimum posterior probability to keep an observation
/// # Panics
/// * if `frequencies` and `assignments` differ in length
pub fn reconcile_strains(
    frequencies: &[FrequencyRecord], assignments: &[ClusterAssignment], probability_cut: f64
) -> (StrainMap, Vec<usize>) {
    assert_eq!(frequencies.len(), assignments.len());

    let mut strains: BTreeSet<usize> = BTreeSet::new();
    // key is (contig, haploset), value is (label sum, count)
    let mut haploset_votes: BTreeMap<(&str, &str), (f64, usize)> = BTreeMap::new();
    let mut dropped: usize = 0;
    for (f, assignment) in frequencies.iter().zip(assignments.iter()) {
        let label: usize = assignment.strain;
        if assignment.strain_proba < probability_cut {
            dropped += 1;
            continue;
        }
        strains.insert(label);
        let votes = haploset_votes.entry((f.contig.as_str(), f.haploset.as_str())).or_insert((0.0, 0));
        votes.0 += label as f64;
        votes.1 += 1;
    }
    debug!("{} / {} observations below strain probability {}", dropped, frequencies.len(), probability_cut);

    let mut strain_map: StrainMap = StrainMap::new();
    for ((contig, haploset), (label_sum, count)) in haploset_votes.into_iter() {
        let strain: usize = (label_sum / count as f64).round_ties_even() as usize;
        strain_map.insert(contig, haploset, strain);
    }

    let strains: Vec<usize> = strains.into_iter().collect();
    info!("{} haplosets assigned to {} strains: {:?}", strain_map.num_haplosets(), strains.len(), strains);
    (strain_map, strains)
}
